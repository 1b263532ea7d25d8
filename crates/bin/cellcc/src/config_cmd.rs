//! `cellcc config`: validate or inspect the resolved configuration.

use cellcc_config::ConfigSource;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to load config: {0}")]
    Config(#[source] cellcc_config::ConfigError),

    #[error("Unknown config directive: {key}")]
    UnknownKey { key: String },

    #[error("Nothing to do: pass --check, --dump, --dump-all, or a directive path")]
    NothingToDo,
}

pub fn run(
    source: ConfigSource,
    check: bool,
    dump: bool,
    dump_all: bool,
    key: Option<String>,
) -> Result<(), Error> {
    // Loading already validates, so --check is just a silent load.
    let config = source.load().map_err(Error::Config)?;

    if check {
        return Ok(());
    }
    if dump || dump_all {
        // The directive record is closed, so dumping "all" directives and
        // dumping the resolved config are the same document.
        println!("{}", config.dump_json());
        return Ok(());
    }
    if let Some(key) = key {
        let value = config.get(&key).ok_or(Error::UnknownKey { key })?;
        match value {
            serde_json::Value::String(s) => println!("{s}"),
            other => println!("{other}"),
        }
        return Ok(());
    }
    Err(Error::NothingToDo)
}
