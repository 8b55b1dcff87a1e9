//! Structured model of hypervisor configuration files.
//!
//! A configuration file is a sequence of blocks. The first block is the
//! current configuration; every following block starts with a `[name]`
//! header and holds the configuration captured by that point-in-time
//! snapshot (or the `[PENDING]` changes). Inside a block each line is a
//! `key: value` setting keyed by hardware slot or option name.
//!
//! Parsing and rendering are deterministic: blank lines only separate
//! blocks, so `render(parse(text))` normalises spacing and nothing else.

use anyhow::{bail, Context, Result};

use crate::storage::parse_size;

const PENDING: &str = "PENDING";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    Current,
    Pending,
    Snapshot(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Setting { key: String, value: String },
    /// Comments and anything else that is not `key: value`
    Raw(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlock {
    pub section: Section,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PveConfig {
    pub blocks: Vec<ConfigBlock>,
}

/// A disk-shaped setting: `<slot>: <pool>:<disk-id>[,<options>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLine<'a> {
    pub slot: &'a str,
    pub pool: &'a str,
    pub disk_id: &'a str,
    /// Everything after the first comma, verbatim
    pub options: &'a str,
}

impl DiskLine<'_> {
    /// `<pool>:<disk-id>`, the disk's unique name
    pub fn volume(&self) -> String {
        format!("{}:{}", self.pool, self.disk_id)
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .split(',')
            .filter_map(|opt| opt.split_once('='))
            .find(|(key, _)| key.trim() == name)
            .map(|(_, value)| value.trim())
    }
}

/// Parse a setting into a [`DiskLine`] if its value names a storage volume
pub fn parse_disk_line<'a>(slot: &'a str, value: &'a str) -> Option<DiskLine<'a>> {
    let (volume, options) = match value.split_once(',') {
        Some((volume, options)) => (volume, options),
        None => (value, ""),
    };
    // Mount points without a volume (e.g. `mp0: /host/dir,mp=/x`) and
    // `none` cdroms have no pool prefix.
    let (pool, disk_id) = volume.trim().split_once(':')?;
    if pool.is_empty() || disk_id.is_empty() || pool.contains(['/', '=']) {
        return None;
    }
    Some(DiskLine {
        slot,
        pool,
        disk_id,
        options,
    })
}

impl ConfigBlock {
    fn new(section: Section) -> Self {
        Self {
            section,
            entries: Vec::new(),
        }
    }

    pub fn settings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Setting { key, value } => Some((key.as_str(), value.as_str())),
            Entry::Raw(_) => None,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// All disk-shaped settings in file order
    pub fn disks(&self) -> impl Iterator<Item = DiskLine<'_>> {
        self.settings()
            .filter_map(|(key, value)| parse_disk_line(key, value))
    }

    /// Whether any disk line in this block points at `volume`
    pub fn references(&self, volume: &str) -> bool {
        self.disks().any(|disk| disk.volume() == volume)
    }

    /// Remove the first disk line pointing at `volume`.
    ///
    /// Returns the slot that was removed.
    pub fn remove_disk(&mut self, volume: &str) -> Option<String> {
        let index = self.entries.iter().position(|entry| match entry {
            Entry::Setting { key, value } => parse_disk_line(key, value)
                .map(|disk| disk.volume() == volume)
                .unwrap_or(false),
            Entry::Raw(_) => false,
        })?;
        match self.entries.remove(index) {
            Entry::Setting { key, .. } => Some(key),
            Entry::Raw(_) => None,
        }
    }
}

impl PveConfig {
    pub fn parse(text: &str) -> Self {
        let mut blocks = vec![ConfigBlock::new(Section::Current)];

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Some(name) = trimmed
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            {
                let section = if name == PENDING {
                    Section::Pending
                } else {
                    Section::Snapshot(name.to_string())
                };
                blocks.push(ConfigBlock::new(section));
                continue;
            }

            let entry = match line.split_once(':') {
                Some((key, value)) if !line.starts_with('#') && !key.contains(char::is_whitespace) => {
                    Entry::Setting {
                        key: key.to_string(),
                        value: value.trim().to_string(),
                    }
                }
                _ => Entry::Raw(line.to_string()),
            };

            if let Some(block) = blocks.last_mut() {
                block.entries.push(entry);
            }
        }

        Self { blocks }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            match &block.section {
                Section::Current => {}
                Section::Pending => push_header(&mut out, PENDING),
                Section::Snapshot(name) => push_header(&mut out, name),
            }
            for entry in &block.entries {
                match entry {
                    Entry::Setting { key, value } if value.is_empty() => {
                        out.push_str(&format!("{}:\n", key));
                    }
                    Entry::Setting { key, value } => {
                        out.push_str(&format!("{}: {}\n", key, value));
                    }
                    Entry::Raw(line) => {
                        out.push_str(line);
                        out.push('\n');
                    }
                }
            }
        }
        out
    }

    pub fn current(&self) -> &ConfigBlock {
        &self.blocks[0]
    }

    pub fn snapshot_mut(&mut self, name: &str) -> Option<&mut ConfigBlock> {
        self.blocks
            .iter_mut()
            .find(|block| matches!(&block.section, Section::Snapshot(n) if n == name))
    }

    /// Names of all snapshot blocks in file order
    pub fn snapshot_names(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|block| match &block.section {
                Section::Snapshot(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

fn push_header(out: &mut String, name: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&format!("[{}]\n", name));
}

/// Everything needed to attach a fresh, empty disk in place of a declared one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecreateSpec {
    pub slot: String,
    pub pool: String,
    /// Size in GiB as accepted by the hypervisor's allocation syntax
    pub size: String,
    /// Remaining options, verbatim and in order, without `size=`
    pub options: String,
}

impl RecreateSpec {
    pub fn parse(slot: &str, value: &str) -> Result<Self> {
        let disk = parse_disk_line(slot, value)
            .with_context(|| format!("'{}: {}' is not a disk line", slot, value))?;
        let size = disk
            .option("size")
            .with_context(|| format!("disk line for {} has no size", slot))?;
        let options: Vec<&str> = disk
            .options
            .split(',')
            .map(str::trim)
            .filter(|opt| !opt.is_empty() && !opt.starts_with("size="))
            .collect();

        Ok(Self {
            slot: slot.to_string(),
            pool: disk.pool.to_string(),
            size: size_in_gib(size)?,
            options: options.join(","),
        })
    }

    /// Value for `--<slot>`: `<pool>:<size>[,<options>]`
    pub fn allocation(&self) -> String {
        if self.options.is_empty() {
            format!("{}:{}", self.pool, self.size)
        } else {
            format!("{}:{},{}", self.pool, self.size, self.options)
        }
    }
}

/// Convert a size such as `8G`, `512M` or `1T` to a GiB number
fn size_in_gib(size: &str) -> Result<String> {
    const GIB: u64 = 1024 * 1024 * 1024;

    let size = size.trim();
    let bytes = match size.strip_suffix('T').or_else(|| size.strip_suffix('t')) {
        Some(tib) => parse_size(tib)?
            .checked_mul(1024 * GIB)
            .with_context(|| format!("disk size '{}' out of range", size))?,
        None => parse_size(size)?,
    };
    if bytes == 0 {
        bail!("disk size '{}' is zero", size);
    }
    if bytes % GIB == 0 {
        return Ok((bytes / GIB).to_string());
    }
    let formatted = format!("{:.3}", bytes as f64 / GIB as f64);
    Ok(formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string())
}
