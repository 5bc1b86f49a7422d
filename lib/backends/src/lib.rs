/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

// The generated module is committed; regenerate it from proto/backends.proto
// with `cargo xtask build-proto`.
pub mod backends;
