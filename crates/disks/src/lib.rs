// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Small numeric/formatting helpers shared by disk- and volume-handling crates.

mod sizing;

pub use sizing::*;
