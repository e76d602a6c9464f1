//
// Copyright (c) The Wren Project Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod config;
pub mod debug;
pub mod error;
pub mod events;
pub mod fsm;
pub mod manager;
pub mod network;
pub mod packet;
pub mod session;
pub mod tasks;
