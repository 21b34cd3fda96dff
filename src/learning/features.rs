use crate::protocol::Task;

/// Hash buckets used to encode capability tags
pub const CAPABILITY_BUCKETS: usize = 8;

/// Length of the vector returned by [`task_features`]
pub const FEATURE_DIM: usize = 3 + CAPABILITY_BUCKETS;

/// Encodes a task as a fixed-length vector in [0, 1]
///
/// Layout: requirement count, priority, context size, then one slot per
/// capability bucket set to 1.0 when any requirement hashes into it.
pub fn task_features(task: &Task) -> Vec<f64> {
    let mut features = Vec::with_capacity(FEATURE_DIM);
    features.push((task.requirements.len() as f64 / 5.0).min(1.0));
    features.push((task.priority.clamp(0, 10) as f64) / 10.0);
    features.push((task.context.len() as f64 / 10.0).min(1.0));

    let mut buckets = [0.0; CAPABILITY_BUCKETS];
    for requirement in &task.requirements {
        buckets[bucket(requirement)] = 1.0;
    }
    features.extend_from_slice(&buckets);
    features
}

/// Discretizes a feature vector into a Q-table key
pub fn state_key(features: &[f64]) -> String {
    let level = |v: f64| ((v.clamp(0.0, 1.0) * 3.0).round()) as u8;
    let head: Vec<String> = features.iter().take(3).map(|v| level(*v).to_string()).collect();
    let bits: String = features
        .iter()
        .skip(3)
        .map(|v| if *v >= 0.5 { '1' } else { '0' })
        .collect();
    format!("{}:{}", head.join(""), bits)
}

// FNV-1a keeps buckets identical across processes and toolchains
fn bucket(tag: &str) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in tag.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % CAPABILITY_BUCKETS as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_features_are_bounded_and_stable() {
        let task = Task::new("x")
            .with_requirements(["research", "code"])
            .with_priority(5)
            .with_context("k", json!(1));
        let features = task_features(&task);

        assert_eq!(features.len(), FEATURE_DIM);
        assert!(features.iter().all(|f| (0.0..=1.0).contains(f)));
        assert_eq!(features, task_features(&task));
        assert!((features[1] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_state_key_groups_similar_tasks() {
        let a = Task::new("a").with_requirements(["code"]).with_priority(5);
        let b = Task::new("b").with_requirements(["code"]).with_priority(5);
        let c = Task::new("c").with_requirements(["research"]).with_priority(5);

        let key = state_key(&task_features(&a));
        assert_eq!(key, state_key(&task_features(&b)));
        if bucket("code") != bucket("research") {
            assert_ne!(key, state_key(&task_features(&c)));
        }
    }
}
