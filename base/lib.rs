// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

pub mod clock;
mod error;
pub mod shutdown;
pub mod strutil;
pub mod time;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};

use std::sync::Mutex as StdMutex;

/// Thin wrapper so call sites read `base::Mutex` the way they read `base::Error`.
///
/// A real `parking_lot`-style non-poisoning mutex would be preferable, but pulling
/// in another crate purely for that isn't worth it here; poisoning is treated as
/// a bug (panic) rather than something callers recover from.
pub struct Mutex<T>(StdMutex<T>);

impl<T> Mutex<T> {
    pub fn new(t: T) -> Self {
        Mutex(StdMutex::new(t))
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        self.0.lock().expect("mutex poisoned")
    }
}

pub use std::sync::Condvar;

pub type FastHashMap<K, V> = std::collections::HashMap<K, V, std::hash::BuildHasherDefault<FxHasher>>;
pub type FastHashSet<K> = std::collections::HashSet<K, std::hash::BuildHasherDefault<FxHasher>>;

/// A small, fast, non-cryptographic hasher in the style of rustc's `FxHash`.
///
/// Used for the in-process maps that back hot paths (schema column cache,
/// per-stream lookups); these are never exposed to attacker-controlled keys.
#[derive(Default)]
pub struct FxHasher {
    hash: u64,
}

const FX_SEED: u64 = 0x51_7c_c1_b7_27_22_0a_95;

impl std::hash::Hasher for FxHasher {
    fn write(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(8) {
            let mut buf = [0u8; 8];
            buf[..chunk.len()].copy_from_slice(chunk);
            let word = u64::from_ne_bytes(buf);
            self.hash = (self.hash.rotate_left(5) ^ word).wrapping_mul(FX_SEED);
        }
    }

    fn finish(&self) -> u64 {
        self.hash
    }
}

#[macro_export]
macro_rules! bail {
    ($($t:tt)+) => {
        return Err($crate::err!($($t)+))
    };
}
