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

pub use tarn_common::{
    clock::{Clock, ManualClock, SystemClock, Timestamp},
    code::{DefaultHashBuilder, HashBuilder, Key, Value},
    error::{Error, ErrorKind, Result},
    metrics::RegistryOps,
};

pub use crate::{
    cache::{Cache, CacheBuilder, CacheConfig, CacheOptions, Weighter, MAX_SLIDING_EXPIRY},
    dependency::{Dependency, DependencyListener, ListenerId, ManualDependency},
    pressure::{FixedSampler, Footprint, FootprintSampler, Thresholds},
    record::{Namespace, Priority, RemovedCallback, RemovedReason},
    router::Enumerate,
};
