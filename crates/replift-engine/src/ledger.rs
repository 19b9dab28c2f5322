use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use replift_core::{RegHive, RegOpKind, RegValueKind, RegistryOperation};

/// One durable record of a destination-tree mutation. Entries are
/// appended and flushed before the mutation they describe becomes
/// visible, so a crashed run can always be unwound from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLedgerEntry {
    CreatedFile(PathBuf),
    CreatedDir(PathBuf),
}

pub fn append_file_entry(ledger: &Path, entry: &FileLedgerEntry) -> Result<()> {
    let line = match entry {
        FileLedgerEntry::CreatedFile(path) => format!("created_file={}\n", path.display()),
        FileLedgerEntry::CreatedDir(path) => format!("created_dir={}\n", path.display()),
    };
    append_line(ledger, &line)
}

pub fn read_file_entries(ledger: &Path) -> Result<Vec<FileLedgerEntry>> {
    let raw = match fs::read_to_string(ledger) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read file ledger: {}", ledger.display()));
        }
    };

    let mut entries = Vec::new();
    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid file ledger line: {line}"))?;
        let entry = match key {
            "created_file" => FileLedgerEntry::CreatedFile(PathBuf::from(value)),
            "created_dir" => FileLedgerEntry::CreatedDir(PathBuf::from(value)),
            other => return Err(anyhow!("unknown file ledger entry kind: {other}")),
        };
        entries.push(entry);
    }
    Ok(entries)
}

/// Appends one inverse registry operation. Replaying the ledger in
/// reverse order restores the pre-update registry state.
pub fn append_registry_entry(ledger: &Path, op: &RegistryOperation) -> Result<()> {
    let mut line = serialize_registry_op(op);
    line.push('\n');
    append_line(ledger, &line)
}

pub fn read_registry_entries(ledger: &Path) -> Result<Vec<RegistryOperation>> {
    let raw = match fs::read_to_string(ledger) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read registry ledger: {}", ledger.display()));
        }
    };

    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_registry_op)
        .collect()
}

fn append_line(ledger: &Path, line: &str) -> Result<()> {
    if let Some(parent) = ledger.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(ledger)
        .with_context(|| format!("failed to open ledger: {}", ledger.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append ledger: {}", ledger.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush ledger: {}", ledger.display()))?;
    Ok(())
}

pub fn serialize_registry_op(op: &RegistryOperation) -> String {
    let mut fields = vec![
        escape_field(op.op.as_str()),
        escape_field(op.hive.as_str()),
        escape_field(&op.key),
        escape_field(op.value_name.as_deref().unwrap_or("")),
        escape_field(op.kind.map(|kind| kind.as_str()).unwrap_or("")),
    ];
    for item in &op.data {
        fields.push(escape_field(item));
    }
    fields.join("\t")
}

pub fn parse_registry_op(line: &str) -> Result<RegistryOperation> {
    let fields: Vec<String> = line
        .split('\t')
        .map(unescape_field)
        .collect::<Result<_>>()?;
    if fields.len() < 5 {
        return Err(anyhow!("invalid registry ledger line: {line}"));
    }

    let op = RegOpKind::parse(&fields[0])
        .ok_or_else(|| anyhow!("unknown registry operation kind: {}", fields[0]))?;
    let hive = RegHive::parse(&fields[1])
        .ok_or_else(|| anyhow!("unknown registry hive: {}", fields[1]))?;
    let value_name = if fields[3].is_empty() {
        None
    } else {
        Some(fields[3].clone())
    };
    let kind = if fields[4].is_empty() {
        None
    } else {
        Some(
            RegValueKind::parse(&fields[4])
                .ok_or_else(|| anyhow!("unknown registry value kind: {}", fields[4]))?,
        )
    };

    Ok(RegistryOperation {
        op,
        hive,
        key: fields[2].clone(),
        value_name,
        kind,
        data: fields[5..].to_vec(),
    })
}

fn escape_field(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\t', "\\t")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn unescape_field(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => return Err(anyhow!("unsupported ledger escape sequence: \\{other}")),
            None => return Err(anyhow!("unterminated ledger escape sequence")),
        }
    }
    Ok(out)
}
