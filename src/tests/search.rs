use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::{orchestrator, put, TTL};
use crate::semantic::{
    normalize, BatchOp, ContentId, DistanceFunction, IndexConfigUpdate, IndexType, Metadata,
    SearchOptions, VectorError,
};

fn ids(results: &[crate::semantic::SearchResult]) -> Vec<&str> {
    results.iter().map(|r| r.id.as_str()).collect()
}

fn with_threshold(threshold: f32) -> SearchOptions {
    SearchOptions {
        threshold,
        ..SearchOptions::default()
    }
}

#[tokio::test]
async fn test_two_note_scenario() {
    let (service, _) = orchestrator(4, DistanceFunction::Cosine);
    put(&service, "n1", "first", &[1.0, 0.0, 0.0, 0.0]).await;
    put(&service, "n2", "second", &[0.0, 1.0, 0.0, 0.0]).await;

    let query = [1.0, 0.0, 0.0, 0.0];

    let all = service
        .similarity_search(&query, &with_threshold(0.0))
        .await
        .unwrap();
    assert_eq!(ids(&all), vec!["n1", "n2"]);
    assert!((all[0].similarity - 1.0).abs() < 1e-6);
    assert!(all[1].similarity.abs() < 1e-6);
    assert!((all[1].distance - 1.0).abs() < 1e-6);

    let close = service
        .similarity_search(&query, &with_threshold(0.5))
        .await
        .unwrap();
    assert_eq!(ids(&close), vec!["n1"]);

    service.delete_vector(&"n1".into()).await.unwrap();
    assert!(service.get_vector(&"n1".into()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_identical_queries_hit_store_once_within_ttl() {
    let (service, backend) = orchestrator(4, DistanceFunction::Cosine);
    put(&service, "n1", "first", &[1.0, 0.0, 0.0, 0.0]).await;

    let query = [0.5, 0.5, 0.0, 0.0];
    let options = with_threshold(0.1);

    let first = service.similarity_search(&query, &options).await.unwrap();
    let second = service.similarity_search(&query, &options).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.scans(), 1);

    tokio::time::advance(TTL).await;

    service.similarity_search(&query, &options).await.unwrap();
    assert_eq!(backend.scans(), 2);
}

#[tokio::test]
async fn test_equivalent_queries_share_cache_entry() {
    let (service, backend) = orchestrator(3, DistanceFunction::Cosine);
    put(&service, "n1", "first", &[1.0, 0.0, 0.0]).await;

    // same direction, so the normalised query and its key are identical
    service
        .similarity_search(&[2.0, 0.0, 0.0], &SearchOptions::default())
        .await
        .unwrap();
    service
        .similarity_search(&[4.0, 0.0, 0.0], &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(backend.scans(), 1);

    service
        .similarity_search(&[4.0, 0.0, 0.0], &with_threshold(0.2))
        .await
        .unwrap();
    assert_eq!(backend.scans(), 2);
}

#[tokio::test]
async fn test_mutations_invalidate_cache() {
    let (service, backend) = orchestrator(2, DistanceFunction::Cosine);
    put(&service, "a", "a", &[1.0, 0.0]).await;

    let query = [1.0, 0.0];
    let before = service
        .similarity_search(&query, &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&before), vec!["a"]);

    put(&service, "b", "b", &[1.0, 0.1]).await;
    let after = service
        .similarity_search(&query, &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&after), vec!["a", "b"]);
    assert_eq!(backend.scans(), 2);

    service.delete_vector(&"a".into()).await.unwrap();
    let after_delete = service
        .similarity_search(&query, &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&after_delete), vec!["b"]);

    let result = service
        .batch(vec![BatchOp::Delete { id: "b".into() }])
        .await;
    assert!(result.is_complete_success());
    assert!(service
        .similarity_search(&query, &SearchOptions::default())
        .await
        .unwrap()
        .is_empty());
    assert_eq!(backend.scans(), 4);
}

#[tokio::test]
async fn test_search_racing_a_store_does_not_cache_stale_results() {
    let (service, backend) = orchestrator(4, DistanceFunction::Cosine);
    let service = Arc::new(service);
    put(&service, "n1", "first", &[1.0, 0.0, 0.0, 0.0]).await;

    let query = [1.0, 0.0, 0.0, 0.0];
    backend.hold_next_scan();
    let search = tokio::spawn({
        let service = Arc::clone(&service);
        async move {
            service
                .similarity_search(&query, &SearchOptions::default())
                .await
        }
    });

    // the scan has read only n1 when n2 lands
    backend.scan_held().await;
    put(&service, "n2", "second", &[1.0, 0.0, 0.0, 0.0]).await;
    backend.release_scan();

    let raced = search.await.unwrap().unwrap();
    assert_eq!(ids(&raced), vec!["n1"]);

    let fresh = service
        .similarity_search(&query, &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&fresh), vec!["n1", "n2"]);
    assert_eq!(backend.scans(), 2);

    // the fresh result is cacheable again
    service
        .similarity_search(&query, &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(backend.scans(), 2);
}

#[tokio::test]
async fn test_wrong_query_dimension_fails_before_io() {
    let (service, backend) = orchestrator(4, DistanceFunction::Cosine);
    put(&service, "n1", "first", &[1.0, 0.0, 0.0, 0.0]).await;

    let err = service
        .similarity_search(&[1.0, 0.0], &SearchOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        VectorError::DimensionMismatch {
            expected: 4,
            actual: 2,
            ..
        }
    ));
    assert!(err.is_client_error());
    assert_eq!(backend.scans(), 0);
}

#[tokio::test]
async fn test_invalid_parameters_rejected() {
    let (service, _) = orchestrator(2, DistanceFunction::Cosine);

    let zero_limit = SearchOptions {
        limit: 0,
        ..SearchOptions::default()
    };
    assert!(matches!(
        service.similarity_search(&[1.0, 0.0], &zero_limit).await,
        Err(VectorError::InvalidParameter { name: "limit", .. })
    ));
    assert!(matches!(
        service
            .similarity_search(&[1.0, 0.0], &with_threshold(-0.1))
            .await,
        Err(VectorError::InvalidParameter { name: "threshold", .. })
    ));
}

#[tokio::test]
async fn test_threshold_never_undercut() {
    let (service, _) = orchestrator(4, DistanceFunction::Cosine);
    for i in 0..20u32 {
        let x = i as f32;
        let vector = [x.sin(), x.cos(), (x * 0.7).sin(), 0.3 - (x * 0.1)];
        put(&service, &format!("n{i:02}"), "note", &vector).await;
    }

    let query = [0.2, 0.9, -0.1, 0.4];
    for threshold in [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0] {
        let options = SearchOptions {
            limit: 50,
            threshold,
            ..SearchOptions::default()
        };
        let results = service.similarity_search(&query, &options).await.unwrap();
        assert!(results.iter().all(|r| r.similarity >= threshold));
        assert!(results
            .windows(2)
            .all(|w| w[0].similarity >= w[1].similarity));
    }
}

#[tokio::test]
async fn test_ties_sorted_by_id_and_truncated() {
    let (service, _) = orchestrator(2, DistanceFunction::Cosine);
    for id in ["c", "a", "d", "b"] {
        put(&service, id, id, &[1.0, 0.0]).await;
    }

    let options = SearchOptions {
        limit: 3,
        ..SearchOptions::default()
    };
    let results = service.similarity_search(&[1.0, 0.0], &options).await.unwrap();
    assert_eq!(ids(&results), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_metadata_filters_and_stripping() {
    let (service, backend) = orchestrator(2, DistanceFunction::Cosine);
    for (id, category, vector) in [
        ("w1", "work", [1.0, 0.0]),
        ("h1", "home", [1.0, 0.1]),
        ("w2", "work", [0.9, 0.3]),
    ] {
        let mut metadata = Metadata::new();
        metadata.insert("category".to_string(), json!(category));
        service.register(&id.into(), metadata).await.unwrap();
        service.store_vector(&id.into(), &vector, None).await.unwrap();
    }

    let mut filters = BTreeMap::new();
    filters.insert("category".to_string(), json!("work"));
    let options = SearchOptions {
        filters,
        ..SearchOptions::default()
    };

    let results = service.similarity_search(&[1.0, 0.0], &options).await.unwrap();
    assert_eq!(ids(&results), vec!["w1", "w2"]);
    assert_eq!(
        results[0].metadata.as_ref().unwrap()["category"],
        json!("work")
    );

    let bare = SearchOptions {
        include_metadata: false,
        ..options.clone()
    };
    let stripped = service.similarity_search(&[1.0, 0.0], &bare).await.unwrap();
    assert_eq!(ids(&stripped), vec!["w1", "w2"]);
    assert!(stripped.iter().all(|r| r.metadata.is_none()));
    // served from the same cache entry
    assert_eq!(backend.scans(), 1);
}

#[tokio::test]
async fn test_round_trip_by_distance_function() {
    let raw = [3.0, -4.0, 12.0];

    let (cosine, _) = orchestrator(3, DistanceFunction::Cosine);
    put(&cosine, "n1", "n1", &raw).await;
    let stored = cosine.get_vector(&"n1".into()).await.unwrap().unwrap();
    for (a, b) in stored.vector.iter().zip(normalize(&raw)) {
        assert!((a - b).abs() < 1e-6);
    }

    let (l2, _) = orchestrator(3, DistanceFunction::L2);
    put(&l2, "n1", "n1", &raw).await;
    let stored = l2.get_vector(&"n1".into()).await.unwrap().unwrap();
    assert_eq!(stored.vector, raw.to_vec());
}

#[tokio::test]
async fn test_dimension_guard_keeps_stored_state() {
    let (service, _) = orchestrator(3, DistanceFunction::L2);
    put(&service, "n1", "n1", &[1.0, 2.0, 3.0]).await;

    let err = service
        .store_vector(&"n1".into(), &[1.0, 2.0, 3.0, 4.0], None)
        .await
        .unwrap_err();
    assert!(matches!(err, VectorError::DimensionMismatch { .. }));

    let stored = service.get_vector(&"n1".into()).await.unwrap().unwrap();
    assert_eq!(stored.vector, vec![1.0, 2.0, 3.0]);
}

#[tokio::test]
async fn test_l2_nearest_first() {
    let (service, _) = orchestrator(2, DistanceFunction::L2);
    put(&service, "far", "far", &[10.0, 10.0]).await;
    put(&service, "near", "near", &[1.0, 1.0]).await;
    put(&service, "exact", "exact", &[0.0, 0.0]).await;

    let results = service
        .similarity_search(&[0.0, 0.0], &SearchOptions::default())
        .await
        .unwrap();

    assert_eq!(ids(&results), vec!["exact", "near", "far"]);
    assert!((results[0].similarity - 1.0).abs() < 1e-6);
    assert!(results[0].distance.abs() < 1e-6);
    for r in &results {
        assert!((r.similarity - 1.0 / (1.0 + r.distance)).abs() < 1e-6);
    }
}

#[tokio::test]
async fn test_inner_product_distance_is_negated_similarity() {
    let (service, _) = orchestrator(2, DistanceFunction::InnerProduct);
    put(&service, "a", "a", &[0.5, 0.0]).await;
    put(&service, "b", "b", &[0.2, 0.0]).await;

    let results = service
        .similarity_search(&[1.0, 0.0], &SearchOptions::default())
        .await
        .unwrap();

    assert_eq!(ids(&results), vec!["a", "b"]);
    for r in &results {
        assert_eq!(r.distance, -r.similarity);
    }
}

#[tokio::test]
async fn test_update_config_clears_cache_and_rescoring() {
    let (service, backend) = orchestrator(2, DistanceFunction::L2);
    put(&service, "a", "a", &[2.0, 0.0]).await;

    let query = [1.0, 0.0];
    let l2 = service
        .similarity_search(&query, &SearchOptions::default())
        .await
        .unwrap();
    assert!((l2[0].distance - 1.0).abs() < 1e-6);

    service
        .update_config(IndexConfigUpdate {
            distance_function: Some(DistanceFunction::InnerProduct),
            index_type: Some(IndexType::IvfFlat),
            ..IndexConfigUpdate::default()
        })
        .unwrap();

    let ip = service
        .similarity_search(&query, &SearchOptions::default())
        .await
        .unwrap();
    assert!((ip[0].similarity - 2.0).abs() < 1e-6);
    assert_eq!(backend.scans(), 2);
    assert_eq!(service.get_config().index_type, IndexType::IvfFlat);
    assert!(service.get_config().ivfflat.is_some());
}

#[tokio::test]
async fn test_distance_switch_keeps_vectors_until_restored() {
    let (service, _) = orchestrator(2, DistanceFunction::Cosine);
    put(&service, "a", "a", &[3.0, 4.0]).await;

    service
        .update_config(IndexConfigUpdate {
            distance_function: Some(DistanceFunction::L2),
            ..IndexConfigUpdate::default()
        })
        .unwrap();

    let kept = service.get_vector(&"a".into()).await.unwrap().unwrap();
    assert!((kept.vector[0] - 0.6).abs() < 1e-6);
    assert!((kept.vector[1] - 0.8).abs() < 1e-6);

    service.store_vector(&"a".into(), &[3.0, 4.0], None).await.unwrap();
    let rebuilt = service.get_vector(&"a".into()).await.unwrap().unwrap();
    assert_eq!(rebuilt.vector, vec![3.0, 4.0]);
}

#[tokio::test]
async fn test_dimensions_fixed_by_update() {
    let (service, _) = orchestrator(2, DistanceFunction::Cosine);
    let result = service.update_config(IndexConfigUpdate {
        dimensions: Some(3),
        ..IndexConfigUpdate::default()
    });
    assert!(matches!(result, Err(VectorError::InvalidParameter { .. })));
    assert_eq!(service.get_config().dimensions, 2);
}

#[tokio::test]
async fn test_stats_and_recommendation() {
    let (service, _) = orchestrator(2, DistanceFunction::Cosine);
    put(&service, "a", "a", &[1.0, 0.0]).await;
    put(&service, "b", "b", &[0.0, 1.0]).await;
    service.register(&"pending".into(), Metadata::new()).await.unwrap();

    let options = SearchOptions::default();
    service.similarity_search(&[1.0, 0.0], &options).await.unwrap();
    service.similarity_search(&[1.0, 0.0], &options).await.unwrap();

    let stats = service.get_stats().await.unwrap();
    let cache = stats.cache.unwrap();
    assert_eq!(stats.embedded_records, 2);
    assert!(!stats.degraded);
    assert_eq!(cache.entries, 1);
    assert_eq!(cache.hits, 1);
    assert_eq!(cache.misses, 1);
    assert!((cache.hit_rate - 0.5).abs() < 1e-9);

    let recommended = service.recommend_for_store().await.unwrap();
    assert_eq!(recommended.index_type, IndexType::IvfFlat);
    assert_eq!(recommended.ivfflat.unwrap().probes, 2);

    let applied = service.apply_recommended_config().await.unwrap();
    assert_eq!(applied.index_type, IndexType::IvfFlat);

    service.clear_cache().unwrap();
    assert_eq!(service.get_stats().await.unwrap().cache.unwrap().entries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_drops_expired_entries() {
    let (service, _) = orchestrator(2, DistanceFunction::Cosine);
    put(&service, "a", "a", &[1.0, 0.0]).await;
    service
        .similarity_search(&[1.0, 0.0], &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(service.get_stats().await.unwrap().cache.unwrap().entries, 1);

    let sweeper = service.spawn_cache_sweeper(Duration::from_secs(10));
    tokio::time::advance(TTL + Duration::from_secs(15)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(service.get_stats().await.unwrap().cache.unwrap().entries, 0);
    sweeper.abort();
}

#[tokio::test]
async fn test_embed_content_skips_unchanged_text() {
    use crate::semantic::{EmbedOutcome, CONTENT_HASH_KEY};

    let (service, _) = orchestrator(32, DistanceFunction::Cosine);
    let id = ContentId::from("n1");
    service.register(&id, Metadata::new()).await.unwrap();

    assert_eq!(
        service.embed_content(&id, "Groceries", "milk eggs").await.unwrap(),
        EmbedOutcome::Embedded
    );
    assert_eq!(
        service.embed_content(&id, " Groceries ", "milk eggs").await.unwrap(),
        EmbedOutcome::Unchanged
    );
    assert_eq!(
        service.embed_content(&id, "Groceries", "milk eggs bread").await.unwrap(),
        EmbedOutcome::Embedded
    );
    assert_eq!(
        service.embed_content(&id, "", "  ").await.unwrap(),
        EmbedOutcome::Empty
    );

    let record = service.get_vector(&id).await.unwrap().unwrap();
    assert!(record.metadata.contains_key(CONTENT_HASH_KEY));

    assert!(matches!(
        service.embed_content(&"ghost".into(), "title", "").await,
        Err(VectorError::RecordNotFound(_))
    ));
}

#[tokio::test]
async fn test_vectors_from_another_provider_are_reembedded() {
    use crate::semantic::{content_hash, EmbedOutcome, CONTENT_HASH_KEY, EMBEDDING_MODEL_KEY};

    let (service, _) = orchestrator(4, DistanceFunction::Cosine);
    let id = ContentId::from("n1");
    let mut metadata = Metadata::new();
    metadata.insert(
        CONTENT_HASH_KEY.to_string(),
        json!(format!("{:016x}", content_hash("Groceries", "milk"))),
    );
    metadata.insert(EMBEDDING_MODEL_KEY.to_string(), json!("bge-base-en-v1.5"));
    service.register(&id, metadata).await.unwrap();
    service
        .store_vector(&id, &[0.0, 0.0, 0.0, 1.0], None)
        .await
        .unwrap();

    assert_eq!(
        service.embed_content(&id, "Groceries", "milk").await.unwrap(),
        EmbedOutcome::Embedded
    );
    let record = service.get_vector(&id).await.unwrap().unwrap();
    assert_eq!(
        record.metadata[EMBEDDING_MODEL_KEY],
        json!(service.embedder().name())
    );

    assert_eq!(
        service.embed_content(&id, "Groceries", "milk").await.unwrap(),
        EmbedOutcome::Unchanged
    );
}

#[tokio::test]
async fn test_transactional_batch_through_service() {
    let (service, backend) = orchestrator(2, DistanceFunction::Cosine);
    put(&service, "a", "a", &[1.0, 0.0]).await;
    service.register(&"b".into(), Metadata::new()).await.unwrap();
    service
        .similarity_search(&[1.0, 0.0], &SearchOptions::default())
        .await
        .unwrap();

    let applied = service
        .batch_transactional(vec![
            BatchOp::Delete { id: "a".into() },
            BatchOp::Store {
                id: "b".into(),
                vector: vec![1.0, 0.0],
                metadata: None,
            },
        ])
        .await
        .unwrap();
    assert_eq!(applied, 2);

    let results = service
        .similarity_search(&[1.0, 0.0], &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["b"]);
    assert_eq!(backend.scans(), 2);
}
