//! Discovery protocol wire types, generated by `build.rs` from the vendored
//! protos under `proto/`.

#![allow(clippy::all, dead_code)]

include!(concat!(env!("OUT_DIR"), "/mod.rs"));
