// Copyright 2026 tarn Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An in-process object cache with time-based expiration, dependency-driven invalidation and trimming under memory
//! pressure.
//!
//! Entries are kept in a sharded hash table. Each shard keeps two secondary indexes: expiration buckets, swept
//! periodically, and usage buckets, which pick the coldest entries when the cache must shrink. A background scheduler
//! drives both.
//!
//! ```
//! use tarn_memory::{CacheBuilder, CacheOptions};
//!
//! let cache = CacheBuilder::<String, u64>::new()
//!     .with_memory_limit(64 << 20)
//!     .build()
//!     .unwrap();
//! cache.insert("answer".to_string(), 42, CacheOptions::default()).unwrap();
//! assert_eq!(cache.get("answer"), Some(42));
//! ```

mod cache;
mod dependency;
mod expiration;
mod gate;
mod pressure;
mod record;
mod router;
mod scheduler;
mod shard;
mod slab;
mod usage;

mod prelude;
pub use prelude::*;
