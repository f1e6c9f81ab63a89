// Copyright 2025 svcdir Authors
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

use crate::registry::PacketStage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Latency summary for one packet stage, in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLatency {
    pub count: u64,
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Complete latency snapshot for one connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub completed: u64,
    pub failed: u64,
    pub stages: HashMap<PacketStage, StageLatency>,
}

impl LatencySnapshot {
    pub fn stage(&self, stage: PacketStage) -> StageLatency {
        self.stages.get(&stage).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes_stage_names() {
        let mut snapshot = LatencySnapshot {
            completed: 3,
            failed: 1,
            ..Default::default()
        };
        snapshot.stages.insert(
            PacketStage::RoundTrip,
            StageLatency {
                count: 3,
                avg_us: 120,
                p50_us: 110,
                p95_us: 190,
                p99_us: 199,
            },
        );

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["completed"], 3);
        assert_eq!(value["stages"]["round_trip"]["p95_us"], 190);

        let decoded: LatencySnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.stage(PacketStage::RoundTrip).count, 3);
        assert_eq!(decoded.stage(PacketStage::Queue), StageLatency::default());
    }
}
