// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared helpers for subcommands: opening the db dir under an flock so two
//! instances can't run against the same database at once.

pub mod check;
pub mod init;
pub mod run;

use base::clock::RealClocks;
use base::Error;
use db::store::Database;
use std::path::Path;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    Create,
}

/// Locks `db_dir` (shared for read-only callers, exclusive otherwise) and
/// opens the database within it. The returned `Fd` must be kept alive as
/// long as the `Database` is in use -- dropping it releases the lock.
pub fn open_db_dir(
    db_dir: &Path,
    migrations_dir: Option<&Path>,
    mode: OpenMode,
) -> Result<(db::dir::Fd, Database<RealClocks>), Error> {
    let fd = db::dir::Fd::open(db_dir, mode == OpenMode::Create).map_err(|e| {
        base::err!(
            e,
            msg(
                "db dir {} not found or inaccessible; try running `vigil-nvr init`",
                db_dir.display()
            )
        )
    })?;
    fd.lock(if mode == OpenMode::ReadOnly {
        nix::fcntl::FlockArg::LockSharedNonblock
    } else {
        nix::fcntl::FlockArg::LockExclusiveNonblock
    })
    .map_err(|e| base::err!(e, msg("another instance already holds {}", db_dir.display())))?;

    let db_path = db_dir.join("db.sqlite3");
    let db = Database::open(&db_path, migrations_dir, RealClocks {})?;
    Ok((fd, db))
}
