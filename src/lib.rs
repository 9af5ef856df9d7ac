//! Distributed multi-process metric store and aggregating Prometheus
//! collector for pre-fork, multi-worker application servers.
//!
//! [`multiproc`] holds the storage-layer and collector substrate (sample key
//! codec, file- and network-backed storage dicts, value cells, the
//! multi-process collector and its managing singleton, server-lifecycle
//! hooks). [`server`] is a small pre-fork master/worker harness that drives
//! those hooks. [`cli`] and [`exporter`] wire both into a runnable binary.

pub mod build_info;
pub mod cli;
pub mod error;
pub mod exporter;
pub mod multiproc;
pub mod server;
