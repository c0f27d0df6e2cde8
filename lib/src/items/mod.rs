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

//! Built-in pipeline items.

mod changes;
mod churn;
mod identity;
mod ticks;

pub use changes::DEP_FILE_DIFFS;
pub use changes::DEP_TREE_CHANGES;
pub use changes::TreeChangesItem;
pub use churn::ChurnReport;
pub use churn::LineChurn;
pub use identity::DEP_AUTHOR;
pub use identity::IdentityDetector;
pub use ticks::DEP_TICK;
pub use ticks::TicksSinceStart;
pub use ticks::tick_of;
