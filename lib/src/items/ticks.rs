// Copyright 2025 The Strata Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Converts commit timestamps to tick numbers.

use std::any::Any;
use std::sync::Arc;

use crate::backend::Commit;
use crate::backend::Repository;
use crate::backend::Tick;
use crate::backend::Timestamp;
use crate::line_history::TREE_MERGE_MARK;
use crate::pipeline::DEP_COMMIT;
use crate::pipeline::Deps;
use crate::pipeline::Outputs;
use crate::pipeline::PipelineItem;
use crate::pipeline::ResolveError;
use crate::pipeline::RunError;
use crate::pipeline::output;

/// Bus key carrying the current commit's tick number (`Tick`).
pub const DEP_TICK: &str = "tick";

/// Whole days between `start` and `t`, clamped at zero.
pub fn tick_of(start: Timestamp, t: Timestamp) -> Tick {
    let elapsed = t.to_datetime().signed_duration_since(start.to_datetime());
    elapsed.num_days().max(0) as Tick
}

/// Provides `tick`: days elapsed since the first consumed commit, clamped
/// monotonically per branch so that commits with out-of-order timestamps
/// never move time backwards.
#[derive(Clone, Debug, Default)]
pub struct TicksSinceStart {
    start: Option<Timestamp>,
    previous: Tick,
}

impl TicksSinceStart {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineItem for TicksSinceStart {
    fn name(&self) -> &'static str {
        "TicksSinceStart"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[DEP_TICK]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    fn initialize(&mut self, _repo: &Arc<Repository>) -> Result<(), ResolveError> {
        self.start = None;
        self.previous = 0;
        Ok(())
    }

    fn consume(&mut self, deps: &Deps) -> Result<Outputs, RunError> {
        let commit = deps.get::<Commit>(DEP_COMMIT)?;
        let timestamp = commit.author.timestamp;
        let start = *self.start.get_or_insert(timestamp);
        let mut tick = tick_of(start, timestamp).max(self.previous);
        if tick >= TREE_MERGE_MARK {
            tracing::warn!(tick, "tick overflows the packed range, clamping");
            tick = TREE_MERGE_MARK - 1;
        }
        self.previous = tick;
        Ok(vec![output(DEP_TICK, tick)])
    }

    fn fork(&mut self, n: usize) -> Vec<Box<dyn PipelineItem>> {
        (0..n)
            .map(|_| Box::new(self.clone()) as Box<dyn PipelineItem>)
            .collect()
    }

    fn merge(&mut self, siblings: &mut [&mut dyn PipelineItem]) {
        for sibling in siblings {
            if let Some(other) = sibling.as_any().downcast_ref::<Self>() {
                self.previous = self.previous.max(other.previous);
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Signature;
    use crate::object_id::CommitId;

    const DAY: i64 = 24 * 3600 * 1000;

    fn commit_at(millis: i64) -> Commit {
        Commit::new(
            CommitId::from_bytes(&millis.to_le_bytes()),
            vec![],
            Signature {
                name: "a".to_owned(),
                email: "a@example.com".to_owned(),
                timestamp: Timestamp::from_millis(millis),
            },
            vec![],
        )
    }

    fn consume_tick(item: &mut TicksSinceStart, millis: i64) -> Tick {
        let mut deps = Deps::new();
        deps.insert(DEP_COMMIT, commit_at(millis));
        let outputs = item.consume(&deps).unwrap();
        *outputs[0].1.downcast_ref::<Tick>().unwrap()
    }

    #[test]
    fn test_tick_of() {
        let start = Timestamp::from_millis(0);
        assert_eq!(tick_of(start, Timestamp::from_millis(0)), 0);
        assert_eq!(tick_of(start, Timestamp::from_millis(DAY - 1)), 0);
        assert_eq!(tick_of(start, Timestamp::from_millis(3 * DAY)), 3);
        // Before the start clamps to zero.
        assert_eq!(tick_of(Timestamp::from_millis(DAY), Timestamp::from_millis(0)), 0);
    }

    #[test]
    fn test_ticks_are_monotonic() {
        let mut item = TicksSinceStart::new();
        assert_eq!(consume_tick(&mut item, 0), 0);
        assert_eq!(consume_tick(&mut item, 2 * DAY), 2);
        // A commit with an earlier timestamp keeps the branch clock.
        assert_eq!(consume_tick(&mut item, DAY), 2);
        assert_eq!(consume_tick(&mut item, 5 * DAY), 5);
    }

    #[test]
    fn test_merge_keeps_latest_clock() {
        let mut item = TicksSinceStart::new();
        consume_tick(&mut item, 0);
        let mut forks = item.fork(1);
        {
            let sibling = forks[0]
                .as_any_mut()
                .downcast_mut::<TicksSinceStart>()
                .unwrap();
            consume_tick(sibling, 9 * DAY);
        }
        let mut siblings: Vec<&mut dyn PipelineItem> =
            forks.iter_mut().map(|b| &mut **b).collect();
        item.merge(&mut siblings);
        assert_eq!(consume_tick(&mut item, DAY), 9);
    }
}
