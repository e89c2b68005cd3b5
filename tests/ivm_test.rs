//! End-to-end incremental maintenance tests.
//!
//! Every test drives the public `Engine` API: documents go into the store,
//! the resulting deltas go into compiled plans, and the maintained output is
//! compared with a from-scratch `execute` of the same pipeline.

use serde_json::{json, Value};

use oxiview::{ComplexityClass, Delta, Engine, EngineConfig, Error, PlanId, RowId};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn debug_engine() -> Engine {
    Engine::with_config(EngineConfig::debug())
}

/// Insert and feed the new row to `plan`.
fn insert(engine: &mut Engine, plan: PlanId, doc: Value) -> RowId {
    let id = engine.add_document(doc).unwrap();
    engine.apply_deltas(&[Delta::insert(id)], plan).unwrap();
    id
}

fn delete(engine: &mut Engine, plan: PlanId, id: RowId) {
    engine.remove_document(id).unwrap();
    engine.apply_deltas(&[Delta::delete(id)], plan).unwrap();
}

fn sorted(mut docs: Vec<Value>) -> Vec<Value> {
    docs.sort_by_key(|d| d.to_string());
    docs
}

/// Maintained output equals a fresh execution, ignoring order.
fn assert_matches_oracle(engine: &mut Engine, plan: PlanId, stages: &Value) {
    let maintained = engine.results(plan).unwrap();
    let oracle = engine.execute(stages).unwrap();
    assert_eq!(sorted(maintained), sorted(oracle), "pipeline {stages}");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn match_group_scenarios() {
    let mut engine = debug_engine();
    for doc in [
        json!({"_id": 1, "cat": "a", "v": 10}),
        json!({"_id": 2, "cat": "a", "v": 5}),
        json!({"_id": 3, "cat": "b", "v": 7}),
    ] {
        engine.add_document(doc).unwrap();
    }
    let stages = json!([
        {"$match": {"v": {"$gte": 6}}},
        {"$group": {"_id": "$cat", "total": {"$sum": "$v"}}}
    ]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    assert_eq!(
        engine.results(plan).unwrap(),
        vec![json!({"_id": "a", "total": 10}), json!({"_id": "b", "total": 7})]
    );

    insert(&mut engine, plan, json!({"_id": 4, "cat": "a", "v": 8}));
    assert_eq!(
        engine.results(plan).unwrap(),
        vec![json!({"_id": "a", "total": 18}), json!({"_id": "b", "total": 7})]
    );

    delete(&mut engine, plan, 0);
    assert_eq!(
        engine.results(plan).unwrap(),
        vec![json!({"_id": "a", "total": 8}), json!({"_id": "b", "total": 7})]
    );
    assert_matches_oracle(&mut engine, plan, &stages);
}

#[test]
fn top_k_scenario() {
    let mut engine = debug_engine();
    for v in [3, 9, 1, 7] {
        engine.add_document(json!({"v": v})).unwrap();
    }
    let stages = json!([{"$sort": {"v": -1}}, {"$limit": 2}]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    assert_eq!(engine.results(plan).unwrap(), vec![json!({"v": 9}), json!({"v": 7})]);

    insert(&mut engine, plan, json!({"v": 20}));
    assert_eq!(engine.results(plan).unwrap(), vec![json!({"v": 20}), json!({"v": 9})]);
    assert_eq!(engine.results(plan).unwrap(), engine.execute(&stages).unwrap());

    let info = engine.plan_info(plan).unwrap();
    assert_eq!(info.stages, vec!["$topK"]);
    assert_eq!(info.complexity, ComplexityClass::LinearLogK);
}

#[test]
fn top_k_refills_after_member_removal() {
    let mut engine = debug_engine();
    let ids: Vec<RowId> = [5, 1, 8, 3]
        .into_iter()
        .map(|v| engine.add_document(json!({"v": v})).unwrap())
        .collect();
    let stages = json!([{"$sort": {"v": 1}}, {"$limit": 2}]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    assert_eq!(engine.results(plan).unwrap(), vec![json!({"v": 1}), json!({"v": 3})]);

    // Removing a member of the full set forces a rescan.
    delete(&mut engine, plan, ids[1]);
    assert_eq!(engine.results(plan).unwrap(), vec![json!({"v": 3}), json!({"v": 5})]);
    insert(&mut engine, plan, json!({"v": 4}));
    assert_eq!(engine.results(plan).unwrap(), vec![json!({"v": 3}), json!({"v": 4})]);
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[test]
fn group_entry_is_evicted_with_its_last_row() {
    let mut engine = debug_engine();
    let stages = json!([{"$group": {"_id": "$k", "n": {"$sum": 1}}}]);
    let plan = engine.compile_pipeline(&stages).unwrap();

    let x = insert(&mut engine, plan, json!({"k": "x"}));
    let y = insert(&mut engine, plan, json!({"k": "y"}));
    assert_eq!(engine.results(plan).unwrap().len(), 2);

    delete(&mut engine, plan, x);
    assert_eq!(engine.results(plan).unwrap(), vec![json!({"_id": "y", "n": 1})]);
    delete(&mut engine, plan, y);
    assert!(engine.results(plan).unwrap().is_empty());
}

#[test]
fn group_arithmetic_is_exact_under_removal() {
    let mut engine = debug_engine();
    let stages = json!([{"$group": {
        "_id": null,
        "sum": {"$sum": "$v"},
        "avg": {"$avg": "$v"},
        "min": {"$min": "$v"},
        "max": {"$max": "$v"},
        "n": {"$count": {}}
    }}]);
    let plan = engine.compile_pipeline(&stages).unwrap();

    let a = insert(&mut engine, plan, json!({"v": 0.1}));
    insert(&mut engine, plan, json!({"v": 0.2}));
    let c = insert(&mut engine, plan, json!({"v": 0.7}));
    insert(&mut engine, plan, json!({"v": 3}));
    delete(&mut engine, plan, a);
    delete(&mut engine, plan, c);

    assert_eq!(engine.results(plan).unwrap(), engine.execute(&stages).unwrap());
    let out = &engine.results(plan).unwrap()[0];
    assert_eq!(out["sum"], json!(3.2));
    assert_eq!(out["avg"], json!(1.6));
    assert_eq!(out["min"], json!(0.2));
    assert_eq!(out["max"], json!(3));
    assert_eq!(out["n"], json!(2));
}

#[test]
fn computed_group_keys() {
    let mut engine = debug_engine();
    let stages = json!([
        {"$group": {"_id": {"y": {"$year": "$at"}, "even": {"$eq": [{"$mod": ["$v", 2]}, 0]}},
                    "vs": {"$push": "$v"}}}
    ]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    insert(&mut engine, plan, json!({"at": "2024-03-01T00:00:00Z", "v": 1}));
    insert(&mut engine, plan, json!({"at": "2024-07-01T00:00:00Z", "v": 3}));
    let b = insert(&mut engine, plan, json!({"at": "2025-01-01T00:00:00Z", "v": 2}));
    assert_eq!(engine.results(plan).unwrap().len(), 2);
    delete(&mut engine, plan, b);
    assert_eq!(
        engine.results(plan).unwrap(),
        vec![json!({"_id": {"y": 2024, "even": false}, "vs": [1, 3]})]
    );
}

#[test]
fn chained_groups() {
    let mut engine = debug_engine();
    let stages = json!([
        {"$group": {"_id": "$k", "n": {"$sum": 1}}},
        {"$group": {"_id": "$n", "keys": {"$addToSet": "$_id"}}}
    ]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    let a1 = insert(&mut engine, plan, json!({"k": "a"}));
    insert(&mut engine, plan, json!({"k": "a"}));
    insert(&mut engine, plan, json!({"k": "b"}));
    assert_eq!(
        engine.results(plan).unwrap(),
        vec![json!({"_id": 1, "keys": ["b"]}), json!({"_id": 2, "keys": ["a"]})]
    );
    delete(&mut engine, plan, a1);
    assert_eq!(engine.results(plan).unwrap(), vec![json!({"_id": 1, "keys": ["a", "b"]})]);
    assert_matches_oracle(&mut engine, plan, &stages);
}

// ---------------------------------------------------------------------------
// Unwind
// ---------------------------------------------------------------------------

#[test]
fn unwind_children_follow_their_parent() {
    let mut engine = debug_engine();
    let stages = json!([{"$unwind": {"path": "$tags", "includeArrayIndex": "i"}}]);
    let plan = engine.compile_pipeline(&stages).unwrap();

    let parent = insert(&mut engine, plan, json!({"n": 1, "tags": ["a", "b", "c"]}));
    insert(&mut engine, plan, json!({"n": 2, "tags": []}));
    assert_eq!(
        engine.results(plan).unwrap(),
        vec![
            json!({"n": 1, "tags": "a", "i": 0}),
            json!({"n": 1, "tags": "b", "i": 1}),
            json!({"n": 1, "tags": "c", "i": 2}),
        ]
    );

    delete(&mut engine, plan, parent);
    assert!(engine.results(plan).unwrap().is_empty());
    assert_matches_oracle(&mut engine, plan, &stages);
}

#[test]
fn unwind_preserve_null_and_empty() {
    let mut engine = debug_engine();
    for doc in [
        json!({"n": 1, "tags": []}),
        json!({"n": 2}),
        json!({"n": 3, "tags": null}),
        json!({"n": 4, "tags": "solo"}),
    ] {
        engine.add_document(doc).unwrap();
    }
    let out = engine
        .execute(&json!([{"$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true}}]))
        .unwrap();
    assert_eq!(
        out,
        vec![
            json!({"n": 1, "tags": null}),
            json!({"n": 2}),
            json!({"n": 3, "tags": null}),
            json!({"n": 4, "tags": "solo"}),
        ]
    );
}

#[test]
fn updating_a_parent_replaces_its_children() {
    let mut engine = debug_engine();
    let stages = json!([
        {"$unwind": "$items"},
        {"$group": {"_id": "$items", "n": {"$sum": 1}}}
    ]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    let id = insert(&mut engine, plan, json!({"items": ["x", "y"]}));
    insert(&mut engine, plan, json!({"items": ["y"]}));

    let deltas = engine.update_document(id, json!({"items": ["z"]})).unwrap();
    let out = engine.apply_deltas(&deltas, plan).unwrap();
    assert_eq!(out, vec![json!({"_id": "y", "n": 1}), json!({"_id": "z", "n": 1})]);
    assert_matches_oracle(&mut engine, plan, &stages);
}

// ---------------------------------------------------------------------------
// Lookup, projection, count
// ---------------------------------------------------------------------------

#[test]
fn lookup_project_and_count() {
    let mut engine = debug_engine();
    engine.register_collection(
        "skus",
        vec![json!({"sku": "p1", "price": 3}), json!({"sku": "p2", "price": 5})],
    );
    let stages = json!([
        {"$lookup": {"from": "skus", "localField": "sku", "foreignField": "sku", "as": "item"}},
        {"$unwind": "$item"},
        {"$addFields": {"total": {"$multiply": ["$qty", "$item.price"]}}},
        {"$project": {"_id": 0, "sku": 1, "total": 1}}
    ]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    insert(&mut engine, plan, json!({"_id": 1, "sku": "p1", "qty": 2}));
    let missing = insert(&mut engine, plan, json!({"_id": 2, "sku": "nope", "qty": 1}));
    insert(&mut engine, plan, json!({"_id": 3, "sku": "p2", "qty": 4}));
    assert_eq!(
        engine.results(plan).unwrap(),
        vec![json!({"sku": "p1", "total": 6}), json!({"sku": "p2", "total": 20})]
    );
    delete(&mut engine, plan, missing);
    assert_matches_oracle(&mut engine, plan, &stages);

    let counted = json!([{"$match": {"qty": {"$gt": 1}}}, {"$count": "big"}]);
    let count_plan = engine.compile_pipeline(&counted).unwrap();
    assert_eq!(engine.results(count_plan).unwrap(), vec![json!({"big": 2})]);
    let id = insert(&mut engine, count_plan, json!({"sku": "p1", "qty": 9}));
    assert_eq!(engine.results(count_plan).unwrap(), vec![json!({"big": 3})]);
    delete(&mut engine, count_plan, id);
    delete(&mut engine, count_plan, 0);
    delete(&mut engine, count_plan, 2);
    assert!(engine.results(count_plan).unwrap().is_empty());
}

#[test]
fn missing_lookup_fields_fail_before_any_document() {
    let mut engine = Engine::new();
    let err = engine
        .compile_pipeline(&json!([{"$lookup": {"from": "x", "localField": "a", "as": "b"}}]))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidLookup(_)));

    let err = engine.compile_pipeline(&json!([{"$bucket": {}}])).unwrap_err();
    assert!(matches!(err, Error::UnsupportedStage(ref s) if s == "$bucket"));
}

// ---------------------------------------------------------------------------
// Plan behaviour
// ---------------------------------------------------------------------------

#[test]
fn snapshot_is_idempotent() {
    let mut engine = debug_engine();
    for v in [4, 2, 9] {
        engine.add_document(json!({"v": v, "tags": ["a", "b"]})).unwrap();
    }
    let stages = json!([
        {"$unwind": "$tags"},
        {"$group": {"_id": "$tags", "total": {"$sum": "$v"}}},
        {"$sort": {"total": -1}}
    ]);
    let first = engine.execute(&stages).unwrap();
    let second = engine.execute(&stages).unwrap();
    assert_eq!(first, second);

    let plan = engine.compile_pipeline(&stages).unwrap();
    let before = engine.results(plan).unwrap();
    let after = engine.apply_deltas(&[], plan).unwrap();
    assert_eq!(before, after);
    assert_eq!(before, first);
}

#[test]
fn repeated_full_recomputes_reuse_operator_state() {
    let mut engine = Engine::with_config(EngineConfig {
        incremental: false,
        ..EngineConfig::debug()
    });
    for (k, tags) in [("a", json!(["x", "y"])), ("b", json!(["y"])), ("a", json!([]))] {
        engine.add_document(json!({"k": k, "tags": tags})).unwrap();
    }
    let stages = json!([
        {"$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true}},
        {"$group": {"_id": "$k", "tags": {"$push": "$tags"}, "n": {"$sum": 1}}}
    ]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    let bootstrapped = engine.results(plan).unwrap();
    let first = engine.apply_deltas(&[], plan).unwrap();
    let second = engine.apply_deltas(&[], plan).unwrap();
    assert_eq!(first, bootstrapped);
    assert_eq!(second, first);
    assert_eq!(second, engine.execute(&stages).unwrap());
    assert_eq!(
        second,
        vec![
            json!({"_id": "a", "tags": ["x", "y", null], "n": 3}),
            json!({"_id": "b", "tags": ["y"], "n": 1}),
        ]
    );
}

#[test]
fn equal_keys_written_differently_follow_surviving_rows() {
    let mut engine = debug_engine();
    let stages = json!([
        {"$group": {"_id": "$k", "n": {"$sum": 1}, "mx": {"$max": "$k"}, "set": {"$addToSet": "$k"}}}
    ]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    let int = insert(&mut engine, plan, json!({"k": 1}));
    insert(&mut engine, plan, json!({"k": 1.0}));
    assert_eq!(
        engine.results(plan).unwrap(),
        vec![json!({"_id": 1, "n": 2, "mx": 1, "set": [1]})]
    );
    delete(&mut engine, plan, int);
    assert_eq!(
        engine.results(plan).unwrap(),
        vec![json!({"_id": 1.0, "n": 1, "mx": 1.0, "set": [1.0]})]
    );
    assert_eq!(engine.results(plan).unwrap(), engine.execute(&stages).unwrap());

    let dates = json!([{"$group": {"_id": "$at", "n": {"$sum": 1}}}]);
    let plan = engine.compile_pipeline(&dates).unwrap();
    let short = insert(&mut engine, plan, json!({"at": "2024-01-01"}));
    insert(&mut engine, plan, json!({"at": "2024-01-01T00:00:00Z"}));
    delete(&mut engine, plan, short);
    let out = engine.results(plan).unwrap();
    assert!(out.contains(&json!({"_id": "2024-01-01T00:00:00Z", "n": 1})));
    assert_eq!(out, engine.execute(&dates).unwrap());
}

#[test]
fn integers_beyond_float_precision_group_apart() {
    let mut engine = debug_engine();
    let stages = json!([{"$group": {"_id": "$k", "n": {"$sum": 1}}}]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    insert(&mut engine, plan, json!({"k": 9007199254740992i64}));
    insert(&mut engine, plan, json!({"k": 9007199254740993i64}));
    let expected = vec![
        json!({"_id": 9007199254740992i64, "n": 1}),
        json!({"_id": 9007199254740993i64, "n": 1}),
    ];
    assert_eq!(engine.results(plan).unwrap(), expected);
    assert_eq!(engine.execute(&stages).unwrap(), expected);
}

#[test]
fn invalid_delta_sets_are_rejected_whole() {
    let mut engine = debug_engine();
    let stages = json!([{"$group": {"_id": null, "n": {"$sum": 1}}}]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    let a = insert(&mut engine, plan, json!({"v": 1}));
    let b = engine.add_document(json!({"v": 2})).unwrap();

    let err = engine
        .apply_deltas(&[Delta::insert(b), Delta::insert(a)], plan)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidDelta(_)));
    assert_eq!(engine.results(plan).unwrap(), vec![json!({"_id": null, "n": 1})]);

    let err = engine.apply_deltas(&[Delta::delete(b)], plan).unwrap_err();
    assert!(matches!(err, Error::InvalidDelta(_)));

    engine.remove_document(b).unwrap();
    let err = engine.apply_deltas(&[Delta::insert(b)], plan).unwrap_err();
    assert!(matches!(err, Error::InvalidDelta(_)));

    // Remove then re-add of the same row inside one set is fine.
    let out = engine
        .apply_deltas(&[Delta::delete(a), Delta::insert(a)], plan)
        .unwrap();
    assert_eq!(out, vec![json!({"_id": null, "n": 1})]);
}

#[test]
fn windowed_aggregates_fall_back_to_recompute() {
    let mut engine = debug_engine();
    let stages = json!([
        {"$skip": 1},
        {"$group": {"_id": "$k", "n": {"$sum": 1}}}
    ]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    let info = engine.plan_info(plan).unwrap();
    assert!(!info.can_increment && !info.can_decrement);

    let first = insert(&mut engine, plan, json!({"k": "a"}));
    insert(&mut engine, plan, json!({"k": "b"}));
    insert(&mut engine, plan, json!({"k": "b"}));
    assert_eq!(engine.results(plan).unwrap(), vec![json!({"_id": "b", "n": 2})]);
    delete(&mut engine, plan, first);
    assert_eq!(engine.results(plan).unwrap(), vec![json!({"_id": "b", "n": 1})]);
    assert_matches_oracle(&mut engine, plan, &stages);
}

#[test]
fn sorted_first_accumulator_uses_sorted_order() {
    let mut engine = debug_engine();
    let stages = json!([
        {"$sort": {"v": -1}},
        {"$group": {"_id": "$k", "top": {"$first": "$v"}, "all": {"$push": "$v"}}}
    ]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    assert!(!engine.plan_info(plan).unwrap().can_increment);
    insert(&mut engine, plan, json!({"k": "a", "v": 1}));
    insert(&mut engine, plan, json!({"k": "a", "v": 5}));
    insert(&mut engine, plan, json!({"k": "a", "v": 3}));
    assert_eq!(
        engine.results(plan).unwrap(),
        vec![json!({"_id": "a", "top": 5, "all": [5, 3, 1]})]
    );
}

#[test]
fn disabling_incremental_mode_still_matches() {
    let config = EngineConfig {
        incremental: false,
        ..EngineConfig::debug()
    };
    let mut engine = Engine::with_config(config);
    let stages = json!([{"$match": {"v": {"$gt": 1}}}, {"$project": {"v": 1, "_id": 0}}]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    assert!(!engine.plan_info(plan).unwrap().can_increment);
    insert(&mut engine, plan, json!({"v": 1}));
    insert(&mut engine, plan, json!({"v": 2}));
    assert_eq!(engine.results(plan).unwrap(), vec![json!({"v": 2})]);
}

#[test]
fn compiled_and_interpreted_engines_agree() {
    let stages = json!([
        {"$match": {"$or": [{"tags": "x"}, {"score": {"$gte": 50}}]}},
        {"$addFields": {
            "grade": {"$cond": {"if": {"$gte": ["$score", 80]}, "then": "A", "else": "B"}},
            "label": {"$concat": [{"$toUpper": "$name"}, "-", {"$substr": ["$name", 0, 1]}]}
        }},
        {"$group": {"_id": "$grade", "names": {"$addToSet": "$label"}, "avg": {"$avg": "$score"}}}
    ]);
    let docs = [
        json!({"name": "ann", "score": 90, "tags": ["x"]}),
        json!({"name": "bob", "score": 40, "tags": ["x", "y"]}),
        json!({"name": "cy", "score": 55}),
        json!({"name": "dee", "score": 10}),
    ];

    let mut outputs = Vec::new();
    for compile in [true, false] {
        let mut engine = Engine::with_config(EngineConfig {
            compile_expressions: compile,
            ..EngineConfig::debug()
        });
        let plan = engine.compile_pipeline(&stages).unwrap();
        for doc in &docs {
            insert(&mut engine, plan, doc.clone());
        }
        let stats = engine.cache_stats();
        if compile {
            assert_eq!(stats.fallbacks, 0);
        } else {
            assert_eq!(stats.fallbacks, stats.misses);
        }
        outputs.push(engine.results(plan).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0].len(), 2);
}

#[test]
fn clear_resets_documents_and_plans() {
    let mut engine = debug_engine();
    let stages = json!([{"$group": {"_id": "$k", "n": {"$sum": 1}}}]);
    let plan = engine.compile_pipeline(&stages).unwrap();
    insert(&mut engine, plan, json!({"k": "a"}));
    engine.clear();
    assert!(engine.is_empty());
    assert!(engine.results(plan).unwrap().is_empty());

    insert(&mut engine, plan, json!({"k": "b"}));
    assert_eq!(engine.results(plan).unwrap(), vec![json!({"_id": "b", "n": 1})]);
}
