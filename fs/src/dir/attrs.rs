//! Node attribute collection for on-disk entries.

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use chrono::{DateTime, Utc};

use casfs_castore::{Error, NodeAttributes};

pub(super) fn node_attributes(
    path: &Path,
    metadata: &Metadata,
    preserve_xattrs: bool,
) -> Result<NodeAttributes, Error> {
    let uid = metadata.uid();
    let gid = metadata.gid();
    let mtime: DateTime<Utc> = metadata.modified()?.into();
    let mode = format!("0o{:o}", metadata.permissions().mode() & 0o7777);

    let xattrs = if preserve_xattrs {
        read_xattrs(path)?
    } else {
        BTreeMap::new()
    };

    Ok(NodeAttributes {
        mtime,
        user_id: uid.to_string(),
        group_id: gid.to_string(),
        user_name: user_name(uid)?,
        group_name: group_name(gid)?,
        mode,
        xattrs,
    })
}

/// Resolves a uid to a user name. Unknown ids map to an empty name;
/// any other lookup failure is surfaced.
fn user_name(uid: u32) -> Result<String, Error> {
    match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => Ok(String::new()),
        Err(errno) => Err(Error::Io(errno.into())),
    }
}

fn group_name(gid: u32) -> Result<String, Error> {
    match nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid)) {
        Ok(Some(group)) => Ok(group.name),
        Ok(None) => Ok(String::new()),
        Err(errno) => Err(Error::Io(errno.into())),
    }
}

/// Reads all extended attributes of a path. Filesystems without xattr
/// support yield an empty map, not an error.
fn read_xattrs(path: &Path) -> Result<BTreeMap<String, Vec<u8>>, Error> {
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) if xattrs_unsupported(&e) => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut out = BTreeMap::new();
    for name in names {
        // an xattr may disappear between list and get; skip it then.
        if let Some(value) = xattr::get(path, &name)? {
            out.insert(name.to_string_lossy().into_owned(), value);
        }
    }
    Ok(out)
}

fn xattrs_unsupported(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(nix::libc::ENOTSUP) | Some(nix::libc::EOPNOTSUPP)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_of_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"content").unwrap();

        let metadata = std::fs::symlink_metadata(&path).unwrap();
        let attributes = node_attributes(&path, &metadata, false).unwrap();

        assert_eq!(attributes.user_id, metadata.uid().to_string());
        assert_eq!(attributes.group_id, metadata.gid().to_string());
        assert!(attributes.mode.starts_with("0o"));
        assert!(attributes.xattrs.is_empty());
    }

    #[test]
    fn current_user_resolves_to_a_name() {
        let uid = nix::unistd::getuid().as_raw();
        let name = user_name(uid).unwrap();
        assert!(!name.is_empty(), "current uid should have a name");
    }

    #[test]
    fn unknown_uid_maps_to_empty_name() {
        // uids this large are not allocated on test systems.
        assert_eq!(user_name(0xfffe_fffe).unwrap(), "");
    }
}
