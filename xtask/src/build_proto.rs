/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use anyhow::Context;
use clap::Parser;

// The generated module is committed so that builds need no protoc; this
// task is the one place that regenerates it.
const PROTO_FILE: &str = "lib/backends/proto/backends.proto";
const OUT_DIR: &str = "lib/backends/src";

#[derive(Debug, Parser)]
pub struct Options {}

pub(crate) fn build_proto(_opts: Options) -> Result<(), anyhow::Error> {
    println!("regenerating {OUT_DIR}/backends.rs from {PROTO_FILE}");

    tonic_build::configure()
        .protoc_arg("--experimental_allow_proto3_optional")
        .build_server(true)
        .out_dir(OUT_DIR)
        .compile(&[PROTO_FILE], &["."])
        .context("protoc invocation failed")?;

    Ok(())
}
