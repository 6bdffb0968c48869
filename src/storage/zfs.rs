//! storage::zfs
//!
//! Backend adapter that drives the `zfs` command line.
//!
//! # Architecture
//!
//! Each [`StorageBackend`] call becomes one or two external commands issued
//! through a [`CommandExecutor`]. Listings use
//! `zfs get -Hp -o name,property,value,source`, which yields one
//! tab-separated row per (object, property). Rows are grouped back into
//! [`DatasetEntry`] values. Only locally set user properties are kept, so
//! inherited metadata from a parent never leaks into a child.
//!
//! Filesystems are created with `mountpoint=legacy`; the engine mounts them
//! explicitly with `mount -t zfs`.
//!
//! Property values listed in [`props::SECRET`] are redacted from logs and
//! error messages.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use super::backend::{
    DatasetEntry, DatasetKind, DestroyMode, KindFilter, ListQuery, PropertyMap, StorageBackend,
};
use super::exec::{CommandError, CommandExecutor, CommandLine, ProcessExecutor};
use super::props;

/// Native properties fetched for every listing.
const NATIVE_PROPERTIES: &[&str] = &[
    "type",
    "creation",
    "logicalreferenced",
    "referenced",
    "used",
    "origin",
    "defer_destroy",
];

/// Backend issuing `zfs` commands.
#[derive(Debug, Clone)]
pub struct ZfsBackend<E: CommandExecutor = ProcessExecutor> {
    executor: E,
}

impl<E: CommandExecutor> ZfsBackend<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    fn zfs(&self) -> CommandLine {
        CommandLine::new("zfs")
    }

    fn run(&self, cmd: CommandLine) -> Result<String, CommandError> {
        self.executor.exec(&cmd)
    }

    /// Append `-o key=value` pairs, redacting secret values.
    fn with_options(mut cmd: CommandLine, properties: &PropertyMap) -> CommandLine {
        for (key, value) in properties {
            cmd = cmd.arg("-o");
            cmd = Self::with_assignment(cmd, key, value);
        }
        cmd
    }

    fn with_assignment(cmd: CommandLine, key: &str, value: &str) -> CommandLine {
        let assignment = format!("{key}={value}");
        if props::is_secret(key) {
            cmd.secret_arg(assignment)
        } else {
            cmd.arg(assignment)
        }
    }
}

/// Parse `zfs get -Hp -o name,property,value,source` output.
///
/// Rows may be missing trailing fields; a row without a value is ignored
/// and a row without a source is treated as not locally set.
pub fn parse_get_output(output: &str, user_properties: &[String]) -> Vec<DatasetEntry> {
    let mut entries: Vec<DatasetEntry> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.splitn(3, '\t');
        let (Some(name), Some(property), Some(rest)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        // Values are JSON and may contain anything but raw tabs are escaped,
        // so the source is whatever follows the last tab.
        let (value, source) = match rest.rsplit_once('\t') {
            Some((v, s)) => (v, s),
            None => (rest, "-"),
        };

        let i = *index.entry(name.to_string()).or_insert_with(|| {
            let kind = if name.contains('@') {
                DatasetKind::Snapshot
            } else {
                DatasetKind::Filesystem
            };
            entries.push(DatasetEntry::new(name, kind));
            entries.len() - 1
        });
        let entry = &mut entries[i];

        let number = || value.parse::<u64>().unwrap_or(0);
        match property {
            "type" => {
                if value == "snapshot" {
                    entry.kind = DatasetKind::Snapshot;
                } else if value == "filesystem" {
                    entry.kind = DatasetKind::Filesystem;
                }
            }
            "creation" => entry.creation = value.parse().ok(),
            "logicalreferenced" => entry.space.logical = number(),
            "referenced" => entry.space.referenced = number(),
            "used" => entry.space.used = number(),
            "origin" => {
                entry.origin = (value != "-" && !value.is_empty()).then(|| value.to_string())
            }
            "defer_destroy" => entry.defer_destroy = value == "on",
            user if user_properties.iter().any(|p| p == user) => {
                if source.starts_with("local") && value != "-" {
                    entry.properties.insert(user.to_string(), value.to_string());
                }
            }
            _ => {}
        }
    }

    entries
}

impl<E: CommandExecutor> StorageBackend for ZfsBackend<E> {
    fn create(&self, dataset: &str, properties: &PropertyMap) -> Result<(), CommandError> {
        let cmd = self.zfs().args(["create", "-o", "mountpoint=legacy"]);
        let cmd = Self::with_options(cmd, properties).arg(dataset);
        self.run(cmd).map(|_| ())
    }

    fn snapshot(
        &self,
        name: &str,
        recursive: bool,
        properties: &PropertyMap,
    ) -> Result<(), CommandError> {
        let mut cmd = self.zfs().arg("snapshot");
        if recursive {
            cmd = cmd.arg("-r");
        }
        let cmd = Self::with_options(cmd, properties).arg(name);
        self.run(cmd).map(|_| ())
    }

    fn clone_snapshot(
        &self,
        snapshot: &str,
        target: &str,
        properties: &PropertyMap,
    ) -> Result<(), CommandError> {
        let cmd = self.zfs().args(["clone", "-o", "mountpoint=legacy"]);
        let cmd = Self::with_options(cmd, properties).args([snapshot, target]);
        self.run(cmd).map(|_| ())
    }

    fn destroy(&self, name: &str, mode: DestroyMode) -> Result<(), CommandError> {
        let mut cmd = self.zfs().arg("destroy");
        if mode.recursive {
            cmd = cmd.arg("-r");
        }
        if mode.deferred {
            cmd = cmd.arg("-d");
        }
        self.run(cmd.arg(name)).map(|_| ())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), CommandError> {
        self.run(self.zfs().args(["rename", from, to])).map(|_| ())
    }

    fn list(&self, root: &str, query: &ListQuery) -> Result<Vec<DatasetEntry>, CommandError> {
        let mut cmd = self.zfs().args(["get", "-Hp"]);
        match query.depth {
            None => cmd = cmd.arg("-r"),
            Some(0) => {}
            Some(depth) => cmd = cmd.args(["-d".to_string(), depth.to_string()]),
        }
        let types = match query.kind {
            KindFilter::All => "filesystem,snapshot",
            KindFilter::Filesystems => "filesystem",
            KindFilter::Snapshots => "snapshot",
        };
        let mut properties: Vec<String> = NATIVE_PROPERTIES.iter().map(|p| p.to_string()).collect();
        properties.extend(query.properties.iter().cloned());

        let cmd = cmd
            .args(["-t", types, "-o", "name,property,value,source"])
            .arg(properties.join(","))
            .arg(root);
        let output = self.run(cmd)?;
        let entries = parse_get_output(&output, &query.properties);
        debug!(root, count = entries.len(), "listed datasets");
        Ok(entries
            .into_iter()
            .filter(|e| query.kind.accepts(e.kind))
            .collect())
    }

    fn set_property(&self, name: &str, property: &str, value: &str) -> Result<(), CommandError> {
        let cmd = Self::with_assignment(self.zfs().arg("set"), property, value).arg(name);
        self.run(cmd).map(|_| ())
    }

    fn clear_property(&self, name: &str, property: &str) -> Result<(), CommandError> {
        self.run(self.zfs().args(["inherit", property, name])).map(|_| ())
    }

    fn mount(&self, dataset: &str, mountpoint: &Path) -> Result<(), CommandError> {
        let mountpoint = mountpoint.to_string_lossy().to_string();
        self.run(CommandLine::new("mkdir").args(["-p", mountpoint.as_str()]))?;
        self.run(CommandLine::new("mount").args(["-t", "zfs", dataset, mountpoint.as_str()]))
            .map(|_| ())
    }

    fn unmount(&self, mountpoint: &Path) -> Result<(), CommandError> {
        self.run(CommandLine::new("umount").arg(mountpoint.to_string_lossy()))
            .map(|_| ())
    }

    fn is_mounted(&self, mountpoint: &Path) -> Result<bool, CommandError> {
        let cmd = CommandLine::new("mountpoint")
            .arg("-q")
            .arg(mountpoint.to_string_lossy());
        match self.run(cmd) {
            Ok(_) => Ok(true),
            Err(e) if e.exit_code.is_some() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn remove_mountpoint(&self, mountpoint: &Path) -> Result<(), CommandError> {
        match self.run(CommandLine::new("rmdir").arg(mountpoint.to_string_lossy())) {
            Err(e) if e.output.contains("No such file or directory") => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Executor returning canned output keyed by command prefix.
    #[derive(Debug, Clone, Default)]
    struct ScriptedExecutor {
        responses: Arc<Mutex<Vec<(String, Result<String, CommandError>)>>>,
        recorded: Arc<Mutex<Vec<String>>>,
        raw: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl ScriptedExecutor {
        fn respond(&self, prefix: &str, result: Result<&str, CommandError>) {
            self.responses
                .lock()
                .unwrap()
                .push((prefix.to_string(), result.map(str::to_string)));
        }

        fn commands(&self) -> Vec<String> {
            self.recorded.lock().unwrap().clone()
        }
    }

    impl CommandExecutor for ScriptedExecutor {
        fn exec(&self, cmd: &CommandLine) -> Result<String, CommandError> {
            let line = cmd.to_string();
            self.recorded.lock().unwrap().push(line.clone());
            self.raw
                .lock()
                .unwrap()
                .push(cmd.argv().iter().map(|s| s.to_string()).collect());
            let responses = self.responses.lock().unwrap();
            responses
                .iter()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, r)| r.clone())
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    fn backend() -> (ZfsBackend<ScriptedExecutor>, ScriptedExecutor) {
        let exec = ScriptedExecutor::default();
        (ZfsBackend::new(exec.clone()), exec)
    }

    #[test]
    fn create_passes_properties() {
        let (zfs, exec) = backend();
        let mut props = PropertyMap::new();
        props.insert(props::METADATA.into(), "{\"a\":\"b\"}".into());
        zfs.create("p/repo/foo", &props).unwrap();
        assert_eq!(
            exec.commands(),
            vec!["zfs create -o mountpoint=legacy -o io.stratum:metadata={\"a\":\"b\"} p/repo/foo"]
        );
    }

    #[test]
    fn secret_properties_are_redacted_but_passed() {
        let (zfs, exec) = backend();
        zfs.set_property("p/repo/foo", props::REMOTES, "[{\"password\":\"x\"}]")
            .unwrap();
        assert_eq!(exec.commands(), vec!["zfs set ***** p/repo/foo"]);
        let raw = exec.raw.lock().unwrap().clone();
        assert_eq!(raw[0][2], "io.stratum:remotes=[{\"password\":\"x\"}]");
    }

    #[test]
    fn destroy_flags() {
        let (zfs, exec) = backend();
        zfs.destroy("p/repo/foo/g@c", DestroyMode::recursive_deferred())
            .unwrap();
        zfs.destroy("p/repo/foo/g", DestroyMode::single()).unwrap();
        assert_eq!(
            exec.commands(),
            vec!["zfs destroy -r -d p/repo/foo/g@c", "zfs destroy p/repo/foo/g"]
        );
    }

    #[test]
    fn list_builds_get_command() {
        let (zfs, exec) = backend();
        let q = ListQuery::default()
            .depth(2)
            .kind(KindFilter::Snapshots)
            .property(props::METADATA);
        zfs.list("p/repo/foo", &q).unwrap();
        assert_eq!(
            exec.commands(),
            vec![
                "zfs get -Hp -d 2 -t snapshot -o name,property,value,source \
                 type,creation,logicalreferenced,referenced,used,origin,defer_destroy,io.stratum:metadata \
                 p/repo/foo"
            ]
        );
    }

    #[test]
    fn parse_groups_rows_and_keeps_local_user_properties() {
        let output = "\
p/repo/foo\ttype\tfilesystem\t-
p/repo/foo\tio.stratum:metadata\t{\"a\":\"b\"}\tlocal
p/repo/foo/g\ttype\tfilesystem\t-
p/repo/foo/g\tio.stratum:metadata\t{\"a\":\"b\"}\tinherited from p/repo/foo
p/repo/foo/g@c1\ttype\tsnapshot\t-
p/repo/foo/g@c1\tcreation\t1556492646\t-
p/repo/foo/g@c1\tlogicalreferenced\t10\t-
p/repo/foo/g@c1\treferenced\t5\t-
p/repo/foo/g@c1\tused\t2\t-
p/repo/foo/g@c1\tdefer_destroy\toff\t-
p/repo/foo/g@c1\torigin\t-\t-
";
        let entries = parse_get_output(output, &[props::METADATA.to_string()]);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].property(props::METADATA), Some("{\"a\":\"b\"}"));
        assert!(entries[1].properties.is_empty());
        let snap = &entries[2];
        assert_eq!(snap.kind, DatasetKind::Snapshot);
        assert_eq!(snap.creation, Some(1556492646));
        assert_eq!(snap.space.logical, 10);
        assert_eq!(snap.space.referenced, 5);
        assert_eq!(snap.space.used, 2);
        assert!(!snap.defer_destroy);
        assert!(snap.origin.is_none());
    }

    #[test]
    fn parse_tolerates_missing_trailing_fields() {
        let output = "p/a\ttype\tfilesystem\np/a\torigin\tp/b@s\np/a\n\n";
        let entries = parse_get_output(output, &[]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].origin.as_deref(), Some("p/b@s"));
    }

    #[test]
    fn parse_value_with_tab_like_content() {
        let output = "p/a\tio.stratum:metadata\t{\"x\":\"a\\tb\"}\tlocal\n";
        let entries = parse_get_output(output, &[props::METADATA.to_string()]);
        assert_eq!(entries[0].property(props::METADATA), Some("{\"x\":\"a\\tb\"}"));
    }

    #[test]
    fn list_errors_propagate() {
        let (zfs, exec) = backend();
        exec.respond(
            "zfs get",
            Err(CommandError::new("zfs get", Some(1), "cannot open 'p/x': dataset does not exist")),
        );
        let err = zfs.list("p/x", &ListQuery::object()).unwrap_err();
        assert!(err.is_does_not_exist());
    }

    #[test]
    fn mount_creates_directory_first() {
        let (zfs, exec) = backend();
        zfs.mount("p/repo/foo/g/v0", Path::new("/mnt/foo/v0")).unwrap();
        assert_eq!(
            exec.commands(),
            vec!["mkdir -p /mnt/foo/v0", "mount -t zfs p/repo/foo/g/v0 /mnt/foo/v0"]
        );
    }

    #[test]
    fn is_mounted_maps_exit_codes() {
        let (zfs, exec) = backend();
        exec.respond("mountpoint", Err(CommandError::new("mountpoint", Some(32), "")));
        assert!(!zfs.is_mounted(Path::new("/mnt/x")).unwrap());
    }

    #[test]
    fn remove_missing_mountpoint_is_ok() {
        let (zfs, exec) = backend();
        exec.respond(
            "rmdir",
            Err(CommandError::new(
                "rmdir",
                Some(1),
                "rmdir: failed to remove '/mnt/x': No such file or directory",
            )),
        );
        zfs.remove_mountpoint(Path::new("/mnt/x")).unwrap();
    }
}
