use super::*;

fn candidates(logits: &[f32]) -> Vec<Candidate> {
    TopKSampler::new(logits.len(), 1.0, 1).unwrap().candidates(logits)
}

#[test]
fn test_candidates_are_sorted_and_truncated() {
    let sampler = TopKSampler::new(3, 0.7, 42).unwrap();
    let top = sampler.candidates(&[0.1, 5.0, -2.0, 3.0, 4.0, 3.0]);

    let ids: Vec<usize> = top.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![1, 4, 3]);
    assert_eq!(top[0].logit, 5.0);
}

#[test]
fn test_candidates_keep_vocabulary_order_on_ties() {
    let sampler = TopKSampler::new(DEFAULT_TOP_K, DEFAULT_TEMPERATURE, 42).unwrap();
    let top = sampler.candidates(&[1.0, 2.0, 2.0, 1.0, 2.0, 0.0, 1.0]);

    let ids: Vec<usize> = top.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![1, 2, 4, 0, 3]);
}

#[test]
fn test_fewer_logits_than_k() {
    let sampler = TopKSampler::new(5, 0.7, 42).unwrap();
    assert_eq!(sampler.candidates(&[1.0, 2.0]).len(), 2);
    assert!(sampler.candidates(&[]).is_empty());
}

#[test]
fn test_sample_with_walks_the_cdf() {
    let sampler = TopKSampler::new(2, 1.0, 1).unwrap();
    // equal logits give two halves
    let top = candidates(&[0.0, 0.0]);

    assert_eq!(sampler.sample_with(&top, 0.0), Some(0));
    assert_eq!(sampler.sample_with(&top, 0.5), Some(0));
    assert_eq!(sampler.sample_with(&top, 0.51), Some(1));
    assert_eq!(sampler.sample_with(&top, 1.0), Some(1));
}

#[test]
fn test_sample_with_falls_back_to_best() {
    let sampler = TopKSampler::new(3, 1.0, 1).unwrap();
    let top = candidates(&[3.0, 1.0, 2.0]);

    assert_eq!(sampler.sample_with(&top, 1.5), Some(0));
    assert_eq!(sampler.sample_with(&[], 0.5), None);
}

#[test]
fn test_near_zero_temperature_is_greedy() {
    let top = candidates(&[0.2, 0.9, 0.85, -1.0]);

    for temperature in [0.0, 1e-6] {
        let mut sampler = TopKSampler::new(4, temperature, 7).unwrap();
        for _ in 0..100 {
            assert_eq!(sampler.sample(&top), Some(1));
        }
    }
}

#[test]
fn test_same_seed_reproduces_draws() {
    let top = candidates(&[1.0, 0.9, 0.8, 0.7, 0.6]);
    let mut a = TopKSampler::new(5, 1.0, 1234).unwrap();
    let mut b = TopKSampler::new(5, 1.0, 1234).unwrap();

    let draws_a: Vec<_> = (0..50).map(|_| a.sample(&top)).collect();
    let draws_b: Vec<_> = (0..50).map(|_| b.sample(&top)).collect();

    assert_eq!(draws_a, draws_b);
    // flat logits spread over more than one candidate
    assert!(draws_a.iter().any(|id| *id != Some(0)));
}

#[test]
fn test_random_f32_stays_in_unit_interval() {
    let mut sampler = TopKSampler::new(1, 1.0, 0).unwrap();
    for _ in 0..1000 {
        let r = sampler.random_f32();
        assert!((0.0..1.0).contains(&r));
    }
}

#[test]
fn test_invalid_settings_are_rejected() {
    assert!(matches!(TopKSampler::new(0, 0.7, 1), Err(Error::Config(_))));
    assert!(matches!(TopKSampler::new(5, -0.1, 1), Err(Error::Config(_))));
    assert!(matches!(TopKSampler::new(5, f32::NAN, 1), Err(Error::Config(_))));
}
