use super::*;

fn hit(id: &str, score: f32) -> SearchHit {
    SearchHit {
        id: id.to_string(),
        kind: EntityKind::Table,
        schema: "dbo".to_string(),
        name: id.to_string(),
        score,
    }
}

#[test]
fn similarity_by_distance_function() {
    let a = [1.0, 0.0];
    let b = [0.0, 1.0];

    assert!((similarity(DistanceFunction::Cosine, &a, &a) - 1.0).abs() < 1e-6);
    assert!(similarity(DistanceFunction::Cosine, &a, &b).abs() < 1e-6);
    assert!(similarity(DistanceFunction::Cosine, &a, &[0.0, 0.0]).abs() < 1e-6);
    assert!((similarity(DistanceFunction::DotProduct, &[2.0, 1.0], &[3.0, 4.0]) - 10.0).abs() < 1e-6);
    assert!((similarity(DistanceFunction::Euclidean, &a, &a) - 1.0).abs() < 1e-6);
    assert!(
        similarity(DistanceFunction::Euclidean, &a, &b)
            < similarity(DistanceFunction::Euclidean, &a, &[0.9, 0.1])
    );
}

#[test]
fn keyword_terms_and_score() {
    let terms = keyword_terms("Who are our TOP customers?");
    assert_eq!(terms, vec!["who", "are", "our", "top", "customers"]);

    assert!((keyword_score(&terms, "Table dbo.Customers lists top buyers") - 0.4).abs() < 1e-6);
    assert!(keyword_score(&[], "anything").abs() < f32::EPSILON);
}

#[test]
fn fusion_rewards_agreement() {
    let vector = vec![hit("a", 0.9), hit("b", 0.8), hit("c", 0.7)];
    let keyword = vec![hit("b", 1.0), hit("c", 0.5)];

    let fused = reciprocal_rank_fusion(&vector, &keyword, 2);

    assert_eq!(fused.len(), 2);
    assert_eq!(fused[0].id, "b");
    assert_eq!(fused[1].id, "c");
    assert!(fused[0].score > fused[1].score);
}

#[test]
fn hits_sort_descending_with_stable_ties() {
    let mut hits = vec![hit("b", 0.5), hit("a", 0.5), hit("c", 0.9)];
    sort_hits(&mut hits);
    let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["c", "a", "b"]);
}
