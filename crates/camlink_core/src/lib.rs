/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod candidate_queue;
pub mod config;
pub mod coordinator;
pub mod hub_client;
pub mod media;
pub mod metrics;
pub mod peer_session;
pub mod relays;
pub mod retry;
pub mod signal_store;
pub mod signaling;
pub mod transport;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
