//! Relaxed-JSON configuration file loading with env-var and CLI overrides.
//!
//! Deserializes a [`Config`](crate::Config) using [Figment], layering three
//! providers from lowest to highest priority:
//!
//! | Priority | Source | Mechanism |
//! |----------|--------|-----------|
//! | 1 (lowest) | JSON5 config file | `merge` — base configuration |
//! | 2 | `CELLCC_CONFIG_*` env vars | `merge` |
//! | 3 (highest) | `-x KEY=VAL` CLI overrides | `merge` — always wins |
//!
//! The config file is JSON with relaxed parsing: `//` and `#`-style comments
//! (`#` lines are rewritten to `//` before parsing, since JSON5 only knows
//! C-style comments), trailing commas, and bare keys are all accepted.
//!
//! Env vars use double underscores to separate nested keys and single
//! underscores in place of hyphens: `CELLCC_CONFIG_DUMP__SCRATCH_DIR` maps to
//! the `dump/scratch-dir` directive.
//!
//! CLI overrides name directives by `/`-separated path. A `json:` prefix on
//! the key requests JSON parsing of the value: `-x json:check/error-limit=3`.

use std::path::Path;

use figment::{
    providers::{Env, Format},
    Figment,
};

use crate::{Config, ConfigError};

/// JSON5 file format for Figment.
///
/// Figment has no built-in relaxed-JSON provider, so we plug the `json5`
/// parser in through its custom-format hook.
pub struct Json5;

impl Format for Json5 {
    type Error = json5::Error;

    const NAME: &'static str = "JSON5";

    fn from_str<T: serde::de::DeserializeOwned>(string: &str) -> Result<T, Self::Error> {
        json5::from_str(string)
    }
}

/// Rewrite `#` comment lines to the `//` form JSON5 understands.
///
/// Both styles are accepted in config files; `#` predates the JSON5 syntax
/// in older deployments.
fn rewrite_hash_comments(contents: &str) -> String {
    contents
        .lines()
        .map(|line| {
            if line.trim_start().starts_with('#') {
                let indent = line.len() - line.trim_start().len();
                format!("{}//{}", &line[..indent], &line.trim_start()[1..])
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A single `-x KEY=VAL` override, parsed from the command line.
#[derive(Debug, Clone)]
pub struct ConfigOverride {
    /// `/`-separated directive path.
    key: String,
    /// Override value; strings stay strings unless `json:` was given.
    value: serde_json::Value,
}

impl ConfigOverride {
    /// Parse a `KEY=VAL` (or `json:KEY=VAL`) argument.
    pub fn parse(arg: &str) -> Result<Self, ConfigError> {
        let (raw_key, raw_value) =
            arg.split_once('=')
                .ok_or_else(|| ConfigError::InvalidOverride {
                    arg: arg.to_string(),
                    reason: "expected KEY=VAL".to_string(),
                })?;

        let (key, value) = match raw_key.strip_prefix("json:") {
            Some(key) => {
                let value = serde_json::from_str(raw_value).map_err(|err| {
                    ConfigError::InvalidOverride {
                        arg: arg.to_string(),
                        reason: format!("invalid JSON value: {err}"),
                    }
                })?;
                (key, value)
            }
            None => (raw_key, serde_json::Value::String(raw_value.to_string())),
        };

        if key.is_empty() {
            return Err(ConfigError::InvalidOverride {
                arg: arg.to_string(),
                reason: "empty directive path".to_string(),
            });
        }

        Ok(Self {
            key: key.to_string(),
            value,
        })
    }

    /// Nest the value under its `/`-separated path, producing a partial
    /// config document suitable for a Figment merge.
    fn to_document(&self) -> serde_json::Value {
        let mut doc = self.value.clone();
        for segment in self.key.split('/').rev() {
            let mut map = serde_json::Map::new();
            map.insert(segment.to_string(), doc);
            doc = serde_json::Value::Object(map);
        }
        doc
    }
}

/// Load a [`Config`] from a file plus env-var and CLI overrides.
///
/// See the [module-level docs](self) for the priority chain. The file may be
/// absent only when `path_is_default` is set (the built-in path is optional;
/// an explicitly requested file must exist).
pub fn load(
    path: &Path,
    path_is_default: bool,
    overrides: &[ConfigOverride],
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        // The built-in default path is allowed to be absent; overrides and
        // env vars may carry the whole configuration.
        Err(_) if path_is_default => String::new(),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::MissingFile {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    // An absent or empty file is an empty document, not a parse error.
    let contents = if contents.trim().is_empty() {
        "{}".to_string()
    } else {
        rewrite_hash_comments(&contents)
    };

    let mut figment = Figment::new()
        .merge(Json5::string(&contents))
        .merge(
            Env::prefixed("CELLCC_CONFIG_")
                .map(|key| {
                    key.as_str()
                        .to_lowercase()
                        .replace("__", ".")
                        .replace('_', "-")
                        .into()
                })
                .split("."),
        );

    for config_override in overrides {
        figment = figment.merge(figment::providers::Serialized::defaults(
            config_override.to_document(),
        ));
    }

    let config: Config = figment.extract().map_err(|err| ConfigError::Figment {
        path: path.to_path_buf(),
        source: Box::new(err),
    })?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp config");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn loads_relaxed_json_with_comments_and_trailing_commas() {
        //* Given
        let file = write_config(
            r#"
            // cellcc configuration
            # hash comments work too
            {
                db: { url: "postgres://localhost/cellcc", },
                cells: {
                    "src.example": { "dst-cells": ["dst.example",], },
                },
                vos: { localauth: true, },
            }
            "#,
        );

        //* When
        let config = load(file.path(), false, &[]).expect("config should load");

        //* Then
        assert_eq!(config.db.url.as_deref(), Some("postgres://localhost/cellcc"));
        assert_eq!(
            config.cells["src.example"].dst_cells,
            vec!["dst.example".to_string()]
        );
        assert_eq!(config.check.error_limit, 5, "defaults apply");
    }

    #[test]
    fn unknown_directives_are_fatal() {
        //* Given
        let file = write_config(
            r#"{ db: { url: "postgres://x/y" }, vos: { localauth: true }, dmup: {} }"#,
        );

        //* When
        let result = load(file.path(), false, &[]);

        //* Then
        assert!(
            matches!(result, Err(ConfigError::Figment { .. })),
            "misspelled directive must be rejected: {result:?}"
        );
    }

    #[test]
    fn missing_explicit_file_is_fatal() {
        let result = load(Path::new("/nonexistent/cellcc.conf"), false, &[]);
        assert!(matches!(result, Err(ConfigError::MissingFile { .. })));
    }

    #[test]
    fn cli_overrides_win_over_the_file() {
        //* Given
        let file = write_config(
            r#"{ db: { url: "postgres://x/y" }, vos: { localauth: true },
                 check: { "error-limit": 9 } }"#,
        );
        let overrides = vec![
            ConfigOverride::parse("json:check/error-limit=3").expect("parse override"),
            ConfigOverride::parse("dump/scratch-dir=/scratch").expect("parse override"),
        ];

        //* When
        let config = load(file.path(), false, &overrides).expect("config should load");

        //* Then
        assert_eq!(config.check.error_limit, 3);
        assert_eq!(config.dump.scratch_dir.to_str(), Some("/scratch"));
    }

    #[test]
    fn override_parse_rejects_bad_arguments() {
        assert!(ConfigOverride::parse("no-equals-sign").is_err());
        assert!(ConfigOverride::parse("json:key=not-json").is_err());
        assert!(ConfigOverride::parse("=value").is_err());
    }

    #[test]
    fn queue_and_release_flag_families_deserialize() {
        //* Given
        let file = write_config(
            r#"{
                db: { url: "postgres://x/y" },
                vos: { localauth: true },
                restore: {
                    queues: {
                        default: { "max-parallel": 4 },
                        slow: {
                            "max-parallel": 1,
                            release: { flags: { "-force": "" } },
                        },
                    },
                },
            }"#,
        );

        //* When
        let config = load(file.path(), false, &[]).expect("config should load");

        //* Then
        assert_eq!(config.restore.queues["default"].max_parallel, 4);
        assert_eq!(config.restore.queues["slow"].max_parallel, 1);
        assert!(config.restore.queues["slow"]
            .release
            .flags
            .contains_key("-force"));
    }
}
