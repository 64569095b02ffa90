/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::{fs, path::{Path, PathBuf}};

/// Behaves like the parts of `ipfs` that backnets use: `init` and `config replace` write the configuration
/// into `$IPFS_PATH/config`, and `daemon` prints the ready line and idles until it is signalled.
const SCRIPT: &str = r#"#!/bin/sh
case "$1" in
    init)
        mkdir -p "$IPFS_PATH"
        cp "$2" "$IPFS_PATH/config"
        ;;
    config)
        cp "$3" "$IPFS_PATH/config"
        ;;
    daemon)
        echo "Initializing daemon..."
        echo "Daemon is ready"
        exec sleep 30
        ;;
    *)
        exit 1
        ;;
esac
"#;

/// A daemon that exits before it is ready.
const FAILING_SCRIPT: &str = r#"#!/bin/sh
case "$1" in
    init)
        mkdir -p "$IPFS_PATH"
        cp "$2" "$IPFS_PATH/config"
        ;;
    daemon)
        echo "Error: address already in use"
        exit 1
        ;;
esac
"#;

pub(crate) fn install(dir: &Path) -> PathBuf {
    write_executable(&dir.join("ipfs-fake"), SCRIPT)
}

pub(crate) fn install_failing(dir: &Path) -> PathBuf {
    write_executable(&dir.join("ipfs-failing"), FAILING_SCRIPT)
}

fn write_executable(path: &Path, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    fs::write(path, script).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}
