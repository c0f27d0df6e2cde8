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

//! Core replay engine for strata.
//!
//! The crate linearizes a commit DAG into an action plan over virtual
//! branches ([`scheduler`]), executes the plan over a dependency-resolved
//! set of analysis items ([`pipeline`]), and tracks per-line authorship of
//! every file as the history replays ([`line_history`], backed by
//! [`rbtree`]). Commits, diffs and identities come from external
//! collaborators behind the [`backend`] traits.

#![deny(unused_must_use)]

pub mod backend;
pub mod graph;
pub mod items;
pub mod line_history;
pub mod object_id;
pub mod pipeline;
pub mod rbtree;
pub mod scheduler;
