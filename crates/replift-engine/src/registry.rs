use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use replift_core::{RegHive, RegOpKind, RegValueKind, RegistryOperation};

use crate::ledger;

/// A stored registry value: its kind plus the string-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegValueData {
    pub kind: RegValueKind,
    pub data: Vec<String>,
}

/// Backend the registry stage mutates. The file-backed implementation
/// below is the default on non-Windows hosts; a platform-native backend
/// plugs in through this trait.
pub trait RegistryStore: Send {
    fn get_value(&self, hive: RegHive, key: &str, name: &str) -> Result<Option<RegValueData>>;
    fn set_value(
        &mut self,
        hive: RegHive,
        key: &str,
        name: &str,
        value: &RegValueData,
    ) -> Result<()>;
    fn delete_value(&mut self, hive: RegHive, key: &str, name: &str) -> Result<()>;
    fn key_exists(&self, hive: RegHive, key: &str) -> Result<bool>;
    fn create_key(&mut self, hive: RegHive, key: &str) -> Result<()>;
    fn delete_key(&mut self, hive: RegHive, key: &str) -> Result<()>;
    /// Direct values of a key, used to build delete-key inverses.
    fn values(&self, hive: RegHive, key: &str) -> Result<Vec<(String, RegValueData)>>;
}

/// One planned mutation: the operation to apply and the inverse
/// operations that undo it, computed from pre-apply state.
#[derive(Debug, Clone)]
pub struct PlannedRegOp {
    pub forward: RegistryOperation,
    pub inverses: Vec<RegistryOperation>,
}

/// The full registry plan for one update. Inverses are computed for
/// every operation before the first mutation happens, so a failure
/// mid-apply can never leave an unplanned hole.
#[derive(Debug, Clone, Default)]
pub struct RegistryPlan {
    pub ops: Vec<PlannedRegOp>,
}

/// Builds the plan. String-like value data passes through the variable
/// expander; everything else is carried verbatim.
pub fn plan_registry(
    store: &dyn RegistryStore,
    operations: &[RegistryOperation],
    resolver: &dyn Fn(&str) -> Option<String>,
) -> Result<RegistryPlan> {
    let mut ops = Vec::with_capacity(operations.len());

    for op in operations {
        let mut forward = op.clone();
        if forward.has_expandable_data() {
            for item in &mut forward.data {
                *item = replift_core::expand(item, resolver);
            }
        }

        let inverses = match forward.op {
            RegOpKind::CreateValue => {
                let name = forward
                    .value_name
                    .as_deref()
                    .ok_or_else(|| anyhow!("create_value operation is missing a value name"))?;
                let mut inverses = Vec::new();
                match store.get_value(forward.hive, &forward.key, name)? {
                    Some(prior) => inverses.push(restore_value_op(&forward, name, &prior)),
                    None => {
                        inverses.push(RegistryOperation {
                            op: RegOpKind::DeleteValue,
                            hive: forward.hive,
                            key: forward.key.clone(),
                            value_name: Some(name.to_string()),
                            kind: None,
                            data: Vec::new(),
                        });
                        // the write implicitly creates the key; undo that too
                        if !store.key_exists(forward.hive, &forward.key)? {
                            inverses.push(RegistryOperation {
                                op: RegOpKind::DeleteKey,
                                hive: forward.hive,
                                key: forward.key.clone(),
                                value_name: None,
                                kind: None,
                                data: Vec::new(),
                            });
                        }
                    }
                }
                inverses
            }
            RegOpKind::DeleteValue => {
                let name = forward
                    .value_name
                    .as_deref()
                    .ok_or_else(|| anyhow!("delete_value operation is missing a value name"))?;
                match store.get_value(forward.hive, &forward.key, name)? {
                    Some(prior) => vec![restore_value_op(&forward, name, &prior)],
                    None => Vec::new(),
                }
            }
            RegOpKind::CreateKey => {
                if store.key_exists(forward.hive, &forward.key)? {
                    Vec::new()
                } else {
                    vec![RegistryOperation {
                        op: RegOpKind::DeleteKey,
                        hive: forward.hive,
                        key: forward.key.clone(),
                        value_name: None,
                        kind: None,
                        data: Vec::new(),
                    }]
                }
            }
            RegOpKind::DeleteKey => {
                if !store.key_exists(forward.hive, &forward.key)? {
                    Vec::new()
                } else {
                    // recreate the key and its direct values; subkeys are
                    // not restored
                    let mut inverses = vec![RegistryOperation {
                        op: RegOpKind::CreateKey,
                        hive: forward.hive,
                        key: forward.key.clone(),
                        value_name: None,
                        kind: None,
                        data: Vec::new(),
                    }];
                    for (name, value) in store.values(forward.hive, &forward.key)? {
                        inverses.push(restore_value_op(&forward, &name, &value));
                    }
                    inverses
                }
            }
        };

        ops.push(PlannedRegOp { forward, inverses });
    }

    Ok(RegistryPlan { ops })
}

fn restore_value_op(template: &RegistryOperation, name: &str, prior: &RegValueData) -> RegistryOperation {
    RegistryOperation {
        op: RegOpKind::CreateValue,
        hive: template.hive,
        key: template.key.clone(),
        value_name: Some(name.to_string()),
        kind: Some(prior.kind),
        data: prior.data.clone(),
    }
}

/// Applies the plan in order, journaling each operation's inverses to
/// the ledger before the mutation lands. Stops on the first failure;
/// rollback then replays the ledger in reverse.
pub fn apply_plan(
    store: &mut dyn RegistryStore,
    plan: &RegistryPlan,
    ledger_path: &Path,
) -> Result<()> {
    for planned in &plan.ops {
        for inverse in &planned.inverses {
            ledger::append_registry_entry(ledger_path, inverse)?;
        }
        apply_op(store, &planned.forward).with_context(|| {
            format!(
                "failed to apply registry operation {} on {}/{}",
                planned.forward.op.as_str(),
                planned.forward.hive.as_str(),
                planned.forward.key
            )
        })?;
    }
    Ok(())
}

/// Applies a single operation to the store.
pub fn apply_op(store: &mut dyn RegistryStore, op: &RegistryOperation) -> Result<()> {
    match op.op {
        RegOpKind::CreateValue => {
            let name = op
                .value_name
                .as_deref()
                .ok_or_else(|| anyhow!("create_value operation is missing a value name"))?;
            let kind = op
                .kind
                .ok_or_else(|| anyhow!("create_value operation is missing a value kind"))?;
            store.set_value(
                op.hive,
                &op.key,
                name,
                &RegValueData {
                    kind,
                    data: op.data.clone(),
                },
            )
        }
        RegOpKind::DeleteValue => {
            let name = op
                .value_name
                .as_deref()
                .ok_or_else(|| anyhow!("delete_value operation is missing a value name"))?;
            store.delete_value(op.hive, &op.key, name)
        }
        RegOpKind::CreateKey => store.create_key(op.hive, &op.key),
        RegOpKind::DeleteKey => store.delete_key(op.hive, &op.key),
    }
}

/// Replays the persisted inverse ledger in reverse order, then removes
/// it. Works from a fresh process: only the ledger file and the store
/// are consulted.
pub fn rollback_registry(store: &mut dyn RegistryStore, ledger_path: &Path) -> Result<()> {
    let entries = ledger::read_registry_entries(ledger_path)?;
    for inverse in entries.iter().rev() {
        apply_op(store, inverse).with_context(|| {
            format!(
                "failed to roll back registry via {} on {}/{}",
                inverse.op.as_str(),
                inverse.hive.as_str(),
                inverse.key
            )
        })?;
    }
    match fs::remove_file(ledger_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove {}", ledger_path.display()))
        }
    }
}

/// File-backed registry store: hives are directories, keys are nested
/// directories, values are one record file each.
#[derive(Debug, Clone)]
pub struct FsRegistryStore {
    root: PathBuf,
}

impl FsRegistryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_dir(&self, hive: RegHive, key: &str) -> Result<PathBuf> {
        let mut dir = self.root.join(hive.as_str());
        for segment in key.split(['/', '\\']).filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(anyhow!("registry key contains an invalid segment: {key}"));
            }
            dir.push(segment);
        }
        Ok(dir)
    }

    fn value_path(&self, hive: RegHive, key: &str, name: &str) -> Result<PathBuf> {
        if name.contains(['/', '\\']) {
            return Err(anyhow!("registry value name contains a path separator: {name}"));
        }
        Ok(self.key_dir(hive, key)?.join(format!("{name}.val")))
    }
}

impl RegistryStore for FsRegistryStore {
    fn get_value(&self, hive: RegHive, key: &str, name: &str) -> Result<Option<RegValueData>> {
        let path = self.value_path(hive, key, name)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read registry value: {}", path.display()));
            }
        };
        parse_value_record(&raw)
            .map(Some)
            .with_context(|| format!("invalid registry value file: {}", path.display()))
    }

    fn set_value(
        &mut self,
        hive: RegHive,
        key: &str,
        name: &str,
        value: &RegValueData,
    ) -> Result<()> {
        let path = self.value_path(hive, key, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = fs::File::create(&path)
            .with_context(|| format!("failed to write registry value: {}", path.display()))?;
        file.write_all(serialize_value_record(value).as_bytes())
            .with_context(|| format!("failed to write registry value: {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush registry value: {}", path.display()))?;
        Ok(())
    }

    fn delete_value(&mut self, hive: RegHive, key: &str, name: &str) -> Result<()> {
        let path = self.value_path(hive, key, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to delete registry value: {}", path.display()))
            }
        }
    }

    fn key_exists(&self, hive: RegHive, key: &str) -> Result<bool> {
        Ok(self.key_dir(hive, key)?.is_dir())
    }

    fn create_key(&mut self, hive: RegHive, key: &str) -> Result<()> {
        let dir = self.key_dir(hive, key)?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create registry key: {}", dir.display()))
    }

    fn delete_key(&mut self, hive: RegHive, key: &str) -> Result<()> {
        let dir = self.key_dir(hive, key)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to delete registry key: {}", dir.display()))
            }
        }
    }

    fn values(&self, hive: RegHive, key: &str) -> Result<Vec<(String, RegValueData)>> {
        let dir = self.key_dir(hive, key)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list registry key: {}", dir.display()));
            }
        };

        let mut values = Vec::new();
        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to list registry key: {}", dir.display()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(name) = file_name.strip_suffix(".val") else {
                continue;
            };
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read registry value: {}", path.display()))?;
            let value = parse_value_record(&raw)
                .with_context(|| format!("invalid registry value file: {}", path.display()))?;
            values.push((name.to_string(), value));
        }
        values.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(values)
    }
}

fn serialize_value_record(value: &RegValueData) -> String {
    let mut out = format!("kind={}\n", value.kind.as_str());
    for item in &value.data {
        out.push_str("data=");
        out.push_str(&item.replace('\\', "\\\\").replace('\n', "\\n"));
        out.push('\n');
    }
    out
}

fn parse_value_record(raw: &str) -> Result<RegValueData> {
    let mut kind = None;
    let mut data = Vec::new();
    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        let (field, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid registry value line: {line}"))?;
        match field {
            "kind" => {
                kind = Some(
                    RegValueKind::parse(value)
                        .ok_or_else(|| anyhow!("unknown registry value kind: {value}"))?,
                );
            }
            "data" => {
                let mut item = String::with_capacity(value.len());
                let mut chars = value.chars();
                while let Some(ch) = chars.next() {
                    if ch != '\\' {
                        item.push(ch);
                        continue;
                    }
                    match chars.next() {
                        Some('\\') => item.push('\\'),
                        Some('n') => item.push('\n'),
                        other => {
                            return Err(anyhow!(
                                "unsupported registry value escape: \\{}",
                                other.map(String::from).unwrap_or_default()
                            ));
                        }
                    }
                }
                data.push(item);
            }
            other => return Err(anyhow!("unknown registry value field: {other}")),
        }
    }
    let kind = kind.ok_or_else(|| anyhow!("registry value record is missing its kind"))?;
    Ok(RegValueData { kind, data })
}
