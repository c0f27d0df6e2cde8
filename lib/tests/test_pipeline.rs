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
use strata_lib::object_id::ObjectId as _;
use strata_lib::pipeline::FactValue;
use strata_lib::pipeline::Pipeline;
use strata_lib::pipeline::Registry;
use strata_lib::pipeline::default_registry;
use strata_lib::pipeline::facts;
use testutils::TestItem;
use testutils::TestRepo;
use testutils::text_of;

/// Five commits where the last merges a branch back.
fn fork_merge_repo() -> TestRepo {
    let mut repo = TestRepo::new();
    let alice = repo.add_author("Alice", "alice@example.com");
    let blob = repo.add_text("aa", text_of(3, "a"));
    repo.add_commit(
        "6db8065cdb9bdb92f1ef30b49dc8df2f1bbf2dc0",
        &[],
        alice,
        0,
        &[("a.rs", blob.clone())],
    );
    repo.add_commit(
        "f30daba81ff2bf0b3ba02a1e1441e74f8a4f6fee",
        &["6db8065cdb9bdb92f1ef30b49dc8df2f1bbf2dc0"],
        alice,
        1,
        &[("a.rs", blob.clone())],
    );
    repo.add_commit(
        "8a03b5620b1caa72ec9cb847ea88332621e2950a",
        &["f30daba81ff2bf0b3ba02a1e1441e74f8a4f6fee"],
        alice,
        2,
        &[("a.rs", blob.clone())],
    );
    repo.add_commit(
        "dd9dd084d5851d7dc4399fc7dbf3d857f7ff25ab",
        &["f30daba81ff2bf0b3ba02a1e1441e74f8a4f6fee"],
        alice,
        2,
        &[("a.rs", blob.clone())],
    );
    repo.add_commit(
        "f4ed0405b14f006c0744029d87ddb3245607587a",
        &[
            "8a03b5620b1caa72ec9cb847ea88332621e2950a",
            "dd9dd084d5851d7dc4399fc7dbf3d857f7ff25ab",
        ],
        alice,
        3,
        &[("a.rs", blob)],
    );
    repo
}

#[test]
fn test_fork_merge_drives_item_lifecycle() {
    let repo = fork_merge_repo();
    let mut pipeline = Pipeline::new(repo.build());
    let item = TestItem::new();
    let state = item.state();
    pipeline.add_item(Box::new(item));
    pipeline.initialize(&Registry::new()).unwrap();
    let outcome = pipeline.run().unwrap();
    assert_eq!(outcome.summary.commit_count, 5);

    let state = state.borrow();
    assert!(state.forked);
    assert!(state.merged);
    assert_eq!(state.commits_seen.len(), 5);
    // The merge commit is visited twice, at two extra increments each; the
    // four ordinary commits count one each.
    assert_eq!(state.merge_state, 8);
    assert_eq!(state.consume_calls, 6);
    // Exactly one post-merge commit sees the is_merge flag.
    assert_eq!(state.merge_flags, 1);
}

#[test]
fn test_linear_history_never_forks() {
    let mut repo = TestRepo::new();
    let alice = repo.add_author("Alice", "alice@example.com");
    let blob = repo.add_text("aa", text_of(2, "a"));
    let hashes = ["01", "02", "03", "04", "05"];
    for (i, hash) in hashes.iter().enumerate() {
        let parents: Vec<&str> = if i == 0 { vec![] } else { vec![hashes[i - 1]] };
        repo.add_commit(hash, &parents, alice, i as i64, &[("a.rs", blob.clone())]);
    }
    let mut pipeline = Pipeline::new(repo.build());
    let item = TestItem::new();
    let state = item.state();
    pipeline.add_item(Box::new(item));
    pipeline.initialize(&Registry::new()).unwrap();
    pipeline.run().unwrap();

    let state = state.borrow();
    assert!(!state.forked);
    assert!(!state.merged);
    assert_eq!(state.consume_calls, 5);
    assert_eq!(state.merge_state, 5);
    assert_eq!(state.merge_flags, 0);
}

#[test]
fn test_churn_end_to_end() {
    let mut repo = TestRepo::new();
    let alice = repo.add_author("Alice", "alice@example.com");
    let bob = repo.add_author("Bob", "bob@example.com");
    let v1 = repo.add_text("a1", text_of(10, "x"));
    let v2 = repo.add_text("a2", format!("{}{}", text_of(6, "x"), text_of(2, "y")));
    repo.add_commit("01", &[], alice, 0, &[("a.rs", v1)]);
    repo.add_commit("02", &["01"], bob, 2, &[("a.rs", v2)]);

    let mut pipeline = Pipeline::new(repo.build());
    pipeline.deploy(default_registry(), "LineChurn");
    pipeline.initialize(default_registry()).unwrap();
    let outcome = pipeline.run().unwrap();
    assert_eq!(outcome.summary.begin_tick, 0);
    assert_eq!(outcome.summary.end_tick, 2);
    assert_eq!(outcome.summary.commit_count, 2);

    let (name, result) = &outcome.results[0];
    assert_eq!(*name, "LineChurn");
    let report = result.downcast_ref::<ChurnReport>().unwrap();
    assert_eq!(report.ticks.len(), 2);
    // Day 0: alice adds the file.
    assert_eq!(report.ticks[0].tick, 0);
    assert_eq!(report.ticks[0].authors.len(), 1);
    assert_eq!(report.ticks[0].authors[0].author, alice);
    assert_eq!(report.ticks[0].authors[0].added, 10);
    // Day 2: bob replaces alice's tail.
    assert_eq!(report.ticks[1].tick, 2);
    let by_author = &report.ticks[1].authors;
    assert_eq!(by_author.len(), 2);
    assert_eq!(by_author[0].author, alice);
    assert_eq!(by_author[0].removed, 4);
    assert_eq!(by_author[1].author, bob);
    assert_eq!(by_author[1].added, 2);
}

#[test]
fn test_resolution_is_stable_across_runs() {
    let repo = fork_merge_repo();
    let order = |_: usize| {
        let mut pipeline = Pipeline::new(repo.build());
        pipeline.deploy(default_registry(), "LineChurn");
        pipeline.add_item(Box::new(TestItem::new()));
        pipeline.initialize(default_registry()).unwrap();
        pipeline.item_names()
    };
    assert_eq!(order(0), order(1));
}

#[test]
fn test_dry_run_skips_execution() {
    let repo = fork_merge_repo();
    let mut pipeline = Pipeline::new(repo.build());
    pipeline.set_fact(facts::DRY_RUN, FactValue::Bool(true));
    let item = TestItem::new();
    let state = item.state();
    pipeline.add_item(Box::new(item));
    pipeline.initialize(&Registry::new()).unwrap();
    let outcome = pipeline.run().unwrap();
    assert_eq!(outcome.summary.commit_count, 5);
    assert_eq!(outcome.summary.end_tick, 3);
    assert!(outcome.results.is_empty());
    assert_eq!(state.borrow().consume_calls, 0);
}

#[test]
fn test_load_commits_from_path() {
    let repo = fork_merge_repo();
    let repository = repo.build();
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("commits.txt");
    std::fs::write(
        &list,
        format!("{}\n{}\n", repo.commits[1].id.hex(), repo.commits[0].id.hex()),
    )
    .unwrap();
    let commits = repository.source.load_commits_from_path(&list).unwrap();
    assert_eq!(commits.len(), 2);
    // File order wins over repository order.
    assert_eq!(commits[0].id, repo.commits[1].id);
    assert_eq!(commits[1].id, repo.commits[0].id);
}

#[test]
fn test_commits_fact_overrides_source() {
    let repo = fork_merge_repo();
    // Restrict the run to the first two commits.
    let commits = repo.commits_rc().into_iter().take(2).collect();
    let mut pipeline = Pipeline::new(repo.build());
    pipeline.set_fact(facts::COMMITS, FactValue::Commits(commits));
    let item = TestItem::new();
    let state = item.state();
    pipeline.add_item(Box::new(item));
    pipeline.initialize(&Registry::new()).unwrap();
    let outcome = pipeline.run().unwrap();
    assert_eq!(outcome.summary.commit_count, 2);
    assert_eq!(state.borrow().consume_calls, 2);
}
