// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! `init` subcommand (§12): creates a fresh db dir and storage root with
//! correct permissions if they don't already exist. Idempotent -- running it
//! again against an already-initialized db dir is a no-op.

use base::Error;
use bpaf::{Bpaf, Parser};
use db::dir::SampleFileDir;
use std::path::PathBuf;
use tracing::info;

pub fn parse_storage_root() -> impl Parser<PathBuf> {
    bpaf::long("storage-root")
        .help("Root directory under which <stream>/YYYY/MM/DD/... recordings live.")
        .argument::<PathBuf>("PATH")
}

#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    #[bpaf(external(crate::parse_db_dir))]
    db_dir: PathBuf,

    #[bpaf(external(parse_storage_root))]
    storage_root: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    // `Database::open` creates the file and applies every pending migration
    // itself; this subcommand's job is just making sure the directories
    // exist (and are lockable/writable) before `run` ever tries to use them.
    let (_fd, db) = super::open_db_dir(&args.db_dir, None, super::OpenMode::Create)?;
    info!(version = ?db.schema_version()?, "database ready");
    SampleFileDir::open(&args.storage_root)?;
    info!(root = %args.storage_root.display(), "storage root ready");
    Ok(0)
}
