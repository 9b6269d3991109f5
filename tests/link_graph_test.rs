//! Link derivation through the full remember path: shared entities produce
//! IDF-weighted edges, and rare entities bind their facts tighter than
//! ubiquitous ones.

mod helpers;

use helpers::{db_path, open_memory, ScriptedModel};
use mnemon::db;
use mnemon::memory::types::FactType;

#[tokio::test]
async fn rare_entity_links_outweigh_common_ones() {
    let model = ScriptedModel::inert()
        .with_entities(&[("Globex", "organization"), ("Acme", "organization")]);
    let (dir, memory) = open_memory(model);

    // Globex appears in two facts, Acme in five
    let globex_peer = memory
        .remember("Globex filed a patent", FactType::World, "manual", None)
        .await
        .unwrap();
    let mut acme_peer_id = String::new();
    for i in 0..5 {
        let fact = memory
            .remember(&format!("Acme event number {i}"), FactType::World, "manual", None)
            .await
            .unwrap();
        if i == 0 {
            acme_peer_id = fact.id;
        }
    }

    let bridge = memory
        .remember("Globex and Acme announced a merger", FactType::World, "manual", None)
        .await
        .unwrap();

    let conn = db::open_database(db_path(&dir)).unwrap();
    let entity_weight = |target: &str| -> f64 {
        conn.query_row(
            "SELECT weight FROM fact_links \
             WHERE source_fact_id = ?1 AND target_fact_id = ?2 AND link_type = 'entity'",
            [&bridge.id, &target.to_string()],
            |r| r.get(0),
        )
        .unwrap()
    };

    let globex_weight = entity_weight(&globex_peer.id);
    let acme_weight = entity_weight(&acme_peer_id);
    assert!(
        globex_weight > acme_weight,
        "rare entity ({globex_weight}) should bind tighter than common ({acme_weight})"
    );
    // Globex now spans 3 facts: 1/log2(4) = 0.5. Acme spans 6: 1/log2(7).
    assert!((globex_weight - 0.5).abs() < 1e-9);
    assert!((acme_weight - 1.0 / 7.0f64.log2()).abs() < 1e-9);
}

#[tokio::test]
async fn every_persisted_link_is_within_bounds() {
    let model = ScriptedModel::inert().with_entities(&[("Acme", "organization")]);
    let (dir, memory) = open_memory(model);

    for text in [
        "Acme signed the deal",
        "Acme signed another deal",
        "something about gardening",
        "Acme keeps signing deals",
    ] {
        memory.remember(text, FactType::World, "manual", None).await.unwrap();
    }

    let conn = db::open_database(db_path(&dir)).unwrap();
    let min_weight = memory.config().linking.min_weight;
    let mut stmt = conn
        .prepare("SELECT weight, link_type FROM fact_links")
        .unwrap();
    let rows: Vec<(f64, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert!(!rows.is_empty());
    for (weight, link_type) in rows {
        assert!(
            weight >= min_weight && weight <= 1.0,
            "{link_type} link weight {weight} outside [{min_weight}, 1.0]"
        );
    }
}

#[tokio::test]
async fn two_hop_recall_reaches_entity_neighborhood() {
    let model = ScriptedModel::inert()
        .with_entities(&[("Dana", "person"), ("Orion", "project")]);
    let (_dir, memory) = open_memory(model);

    let seed = memory
        .remember("Dana runs the roadmap review", FactType::World, "manual", None)
        .await
        .unwrap();
    let one_hop = memory
        .remember("Dana leads project Orion", FactType::World, "manual", None)
        .await
        .unwrap();
    let two_hop = memory
        .remember("Orion ships next quarter", FactType::World, "manual", None)
        .await
        .unwrap();

    let ctx = memory.recall("roadmap review", None).await.unwrap();
    let ids: Vec<&str> = ctx.facts.iter().map(|f| f.fact.id.as_str()).collect();
    assert_eq!(ids[0], seed.id.as_str());
    assert!(ids.contains(&one_hop.id.as_str()), "shared-person fact missing");
    assert!(ids.contains(&two_hop.id.as_str()), "two-hop project fact missing");
}
