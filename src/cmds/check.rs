// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! `check` subcommand (§12): offline integrity sweep over the db and sample
//! file dir. Intended to run against a stopped instance -- it takes the
//! same exclusive db dir lock `run` does, so it will refuse to start
//! alongside a live process rather than racing it.

use base::Error;
use bpaf::{Bpaf, Parser};
use db::dir::SampleFileDir;
use std::path::PathBuf;
use tracing::{error, info};

fn parse_trash_orphan_sample_files() -> impl Parser<bool> {
    bpaf::long("trash-orphan-sample-files")
        .help("Trash sample files without matching recording rows in the database.")
        .switch()
}

fn parse_delete_orphan_rows() -> impl Parser<bool> {
    bpaf::long("delete-orphan-rows")
        .help("Delete recording rows in the database without matching sample files.")
        .switch()
}

#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    #[bpaf(external(crate::parse_db_dir))]
    db_dir: PathBuf,

    #[bpaf(external(super::init::parse_storage_root))]
    storage_root: PathBuf,

    #[bpaf(external(parse_trash_orphan_sample_files))]
    trash_orphan_sample_files: bool,

    #[bpaf(external(parse_delete_orphan_rows))]
    delete_orphan_rows: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let (_fd, db) = super::open_db_dir(&args.db_dir, None, super::OpenMode::ReadWrite)?;
    let dir = SampleFileDir::open(&args.storage_root)?;
    let report = db::check::run(
        &db,
        &dir,
        &db::check::Options {
            trash_orphan_sample_files: args.trash_orphan_sample_files,
            delete_orphan_rows: args.delete_orphan_rows,
        },
    )?;

    if report.is_clean() {
        info!("check passed: no issues found");
        return Ok(0);
    }
    error!(
        integrity_errors = report.integrity_errors.len(),
        schema_mismatch = ?report.schema_version_mismatch,
        orphan_files = report.orphan_files.len(),
        orphan_rows = report.orphan_rows.len(),
        trashed_files = report.trashed_files,
        deleted_rows = report.deleted_rows,
        "check found issues"
    );
    Ok(1)
}
