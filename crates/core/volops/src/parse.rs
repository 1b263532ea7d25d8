//! Parsers for the admin CLI's machine-readable output.
//!
//! The `vos`-like tool is consumed through a narrow interface: the
//! `-format` name/value listing from `examine`, the per-site lines from
//! `listvldb`, and the `dump_size:` line from `size`. Everything else the
//! tool prints is ignored.

use crate::error::VosError;

/// Details of a volume from `examine -format`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    /// Epoch seconds of the volume's last update.
    pub update_date: i64,
    /// Backup volume ID; `None` when no backup clone exists.
    pub backup_id: Option<u64>,
}

/// Parse the name/value lines of `examine -format`.
pub fn parse_examine(output: &str) -> Result<VolumeInfo, VosError> {
    let mut name = None;
    let mut update_date = None;
    let mut backup_id = None;

    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        let Some(key) = tokens.next() else { continue };
        let value = tokens.next();
        match key {
            "name" => name = value.map(str::to_string),
            "updateDate" => {
                update_date = Some(parse_number(value, "updateDate", line)? as i64);
            }
            "backupID" => {
                let id = parse_number(value, "backupID", line)?;
                backup_id = (id != 0).then_some(id);
            }
            _ => {}
        }
    }

    Ok(VolumeInfo {
        name: name.ok_or_else(|| parse_error("examine output has no name line", output))?,
        update_date: update_date
            .ok_or_else(|| parse_error("examine output has no updateDate line", output))?,
        backup_id,
    })
}

fn parse_number(value: Option<&str>, field: &str, line: &str) -> Result<u64, VosError> {
    value
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| parse_error(field, line))
}

/// Where a copy of a volume lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteType {
    ReadWrite,
    ReadOnly,
    Backup,
}

/// One `server ... partition ...` line from `listvldb`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub server: String,
    pub partition: String,
    pub site_type: SiteType,
    /// Trailing status annotation, e.g. `-- Not released`.
    pub status: Option<String>,
}

impl Site {
    /// Whether the site is flagged as carrying unreleased or stale data.
    pub fn is_stale(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|status| status.contains("Not released") || status.contains("Old release"))
    }
}

/// Site listing for one volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteList {
    pub sites: Vec<Site>,
    /// Whether the volume's VLDB entry is locked.
    pub locked: bool,
}

impl SiteList {
    pub fn rw_site(&self) -> Option<&Site> {
        self.sites
            .iter()
            .find(|site| site.site_type == SiteType::ReadWrite)
    }

    pub fn ro_sites(&self) -> impl Iterator<Item = &Site> {
        self.sites
            .iter()
            .filter(|site| site.site_type == SiteType::ReadOnly)
    }
}

/// Parse the site lines of a `listvldb` entry.
pub fn parse_sites(output: &str) -> Result<SiteList, VosError> {
    let mut list = SiteList::default();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.contains("LOCKED") {
            list.locked = true;
            continue;
        }
        if !trimmed.starts_with("server ") {
            continue;
        }

        // server fs1.example.com partition /vicepa RW Site [-- status]
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if tokens.len() < 6 || tokens[0] != "server" || tokens[2] != "partition" {
            return Err(parse_error("unrecognized site line", line));
        }
        let site_type = match tokens[4] {
            "RW" => SiteType::ReadWrite,
            "RO" => SiteType::ReadOnly,
            "BK" => SiteType::Backup,
            _ => return Err(parse_error("unrecognized site type", line)),
        };
        let status = (tokens.len() > 6).then(|| tokens[6..].join(" "));
        list.sites.push(Site {
            server: tokens[1].to_string(),
            partition: tokens[3].to_string(),
            site_type,
            status,
        });
    }

    Ok(list)
}

/// Parse the `dump_size:` line of `size -dump`.
pub fn parse_dump_size(output: &str) -> Result<u64, VosError> {
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix("dump_size:") {
            return rest
                .trim()
                .parse()
                .map_err(|_| parse_error("dump_size", line));
        }
    }
    Err(parse_error("size output has no dump_size line", output))
}

fn parse_error(what: &str, snippet: &str) -> VosError {
    VosError::Parse {
        what: what.to_string(),
        snippet: snippet.chars().take(200).collect(),
    }
}
