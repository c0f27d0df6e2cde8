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

use pretty_assertions::assert_eq;
use strata_lib::items::ChurnReport;
use strata_lib::pipeline::FactValue;
use strata_lib::pipeline::Pipeline;
use strata_lib::pipeline::default_registry;
use strata_lib::pipeline::facts;
use testutils::TestItem;
use testutils::TestRepo;
use testutils::text_of;

/// A fork whose side branch stays idle long enough for the scheduler to
/// hibernate it: one long feature chain, one short one, merged at the end.
fn forked_repo() -> TestRepo {
    let mut repo = TestRepo::new();
    let alice = repo.add_author("Alice", "alice@example.com");
    let m1 = repo.add_text("a1", text_of(5, "m"));
    let m2 = repo.add_text("a2", text_of(6, "m"));
    let l1 = repo.add_text("b1", text_of(3, "l"));
    let l2 = repo.add_text("b2", text_of(4, "l"));
    let u1 = repo.add_text("c1", text_of(2, "u"));
    let d1 = repo.add_text("d1", text_of(7, "d"));
    repo.add_commit("aa", &[], alice, 0, &[("main.rs", m1.clone())]);
    repo.add_commit(
        "b0",
        &["aa"],
        alice,
        1,
        &[("main.rs", m1.clone()), ("lib.rs", l1)],
    );
    repo.add_commit(
        "b1",
        &["b0"],
        alice,
        1,
        &[("main.rs", m1.clone()), ("lib.rs", l2.clone())],
    );
    repo.add_commit(
        "b2",
        &["b1"],
        alice,
        2,
        &[("main.rs", m1.clone()), ("lib.rs", l2.clone()), ("util.rs", u1.clone())],
    );
    repo.add_commit(
        "b3",
        &["b2"],
        alice,
        2,
        &[("main.rs", m2.clone()), ("lib.rs", l2.clone()), ("util.rs", u1.clone())],
    );
    repo.add_commit(
        "c0",
        &["aa"],
        alice,
        3,
        &[("main.rs", m1), ("doc.md", d1.clone())],
    );
    repo.add_commit(
        "dd",
        &["b3", "c0"],
        alice,
        4,
        &[
            ("main.rs", m2),
            ("lib.rs", l2),
            ("util.rs", u1),
            ("doc.md", d1),
        ],
    );
    repo
}

fn churn_report(repo: &TestRepo, extra_facts: &[(&str, FactValue)]) -> ChurnReport {
    let mut pipeline = Pipeline::new(repo.build());
    for (key, value) in extra_facts {
        pipeline.set_fact(*key, value.clone());
    }
    pipeline.deploy(default_registry(), "LineChurn");
    pipeline.initialize(default_registry()).unwrap();
    let outcome = pipeline.run().unwrap();
    let (_, result) = outcome
        .results
        .into_iter()
        .find(|(name, _)| *name == "LineChurn")
        .unwrap();
    *result.downcast::<ChurnReport>().unwrap()
}

#[test]
fn test_hibernating_branches_produce_identical_results() {
    let repo = forked_repo();
    let plain = churn_report(&repo, &[]);
    let hibernated = churn_report(
        &repo,
        &[(facts::HIBERNATION_DISTANCE, FactValue::Int(1))],
    );
    assert_eq!(plain, hibernated);
    // Sanity: the history actually produced churn.
    assert!(!plain.ticks.is_empty());
}

#[test]
fn test_hibernation_on_disk_cleans_up_scratch_files() {
    let dir = tempfile::tempdir().unwrap();
    let repo = forked_repo();
    let report = churn_report(
        &repo,
        &[
            (facts::HIBERNATION_DISTANCE, FactValue::Int(1)),
            (facts::LINE_HISTORY_HIBERNATION_ON_DISK, FactValue::Bool(true)),
            (
                facts::LINE_HISTORY_HIBERNATION_DIRECTORY,
                FactValue::Path(dir.path().to_owned()),
            ),
        ],
    );
    assert_eq!(report, churn_report(&repo, &[]));
    // Every scratch file was removed when its branch booted.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_hibernate_and_boot_reach_items() {
    let repo = forked_repo();
    let mut pipeline = Pipeline::new(repo.build());
    pipeline.set_fact(facts::HIBERNATION_DISTANCE, FactValue::Int(1));
    let item = TestItem::new();
    let state = item.state();
    pipeline.add_item(Box::new(item));
    pipeline
        .initialize(&strata_lib::pipeline::Registry::new())
        .unwrap();
    pipeline.run().unwrap();
    let state = state.borrow();
    assert!(state.hibernations >= 1);
    assert_eq!(state.hibernations, state.boots);
}

#[test]
fn test_debug_validation_run() {
    // Tree-invariant validation after every edit must not fire on a
    // healthy history.
    let repo = forked_repo();
    let report = churn_report(
        &repo,
        &[(facts::LINE_HISTORY_DEBUG, FactValue::Bool(true))],
    );
    assert_eq!(report, churn_report(&repo, &[]));
}
