// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod client;
pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod tls;
pub mod wallet;
