//! Partition assignment.
//!
//! Partitions of a topic are split into contiguous ranges over the sorted
//! list of live instance ids: with `P` partitions and `N` instances, every
//! instance receives `P / N` partitions and the first `P % N` instances
//! take one extra.
//!
//! The algorithm is deliberately boring because its properties carry the
//! coordination protocol:
//!
//! - every partition lands on exactly one instance;
//! - no two instances differ by more than one partition;
//! - identical inputs produce identical outputs, so every instance can
//!   compute the assignment independently and agree without a central
//!   coordinator;
//! - adding or removing one instance moves at most ⌈P/N⌉ partitions.

use std::collections::HashMap;

/// A partition of a topic together with its leader broker id. The leader
/// is informational only; it does not influence the assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub id: i32,
    pub leader: i32,
}

/// Distribute `partitions` across `instances`, returning the partition
/// range owned by each instance id.
///
/// Inputs are sorted internally (instances by id, partitions by partition
/// id), so callers may pass snapshots in any order and still obtain the
/// deterministic result.
pub fn assign_partitions(
    instances: &[String],
    partitions: &[PartitionInfo],
) -> HashMap<String, Vec<PartitionInfo>> {
    let mut result: HashMap<String, Vec<PartitionInfo>> = instances
        .iter()
        .map(|id| (id.clone(), Vec::new()))
        .collect();
    if instances.is_empty() || partitions.is_empty() {
        return result;
    }

    let mut instances: Vec<&String> = instances.iter().collect();
    instances.sort();
    instances.dedup();

    let mut partitions = partitions.to_vec();
    partitions.sort_by_key(|p| p.id);

    let base = partitions.len() / instances.len();
    let extra = partitions.len() % instances.len();

    let mut next = 0;
    for (index, instance) in instances.iter().enumerate() {
        let range = base + usize::from(index < extra);
        if let Some(assigned) = result.get_mut(instance.as_str()) {
            assigned.extend_from_slice(&partitions[next..next + range]);
        }
        next += range;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitions(count: i32) -> Vec<PartitionInfo> {
        (0..count).map(|id| PartitionInfo { id, leader: 0 }).collect()
    }

    fn ids(assignment: &HashMap<String, Vec<PartitionInfo>>, instance: &str) -> Vec<i32> {
        assignment[instance].iter().map(|p| p.id).collect()
    }

    #[test]
    fn even_distribution() {
        let instances = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let assignment = assign_partitions(&instances, &partitions(6));

        assert_eq!(ids(&assignment, "a"), vec![0, 1]);
        assert_eq!(ids(&assignment, "b"), vec![2, 3]);
        assert_eq!(ids(&assignment, "c"), vec![4, 5]);
    }

    #[test]
    fn uneven_distribution_front_loads_extras() {
        let instances = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let assignment = assign_partitions(&instances, &partitions(7));

        assert_eq!(ids(&assignment, "a"), vec![0, 1, 2]);
        assert_eq!(ids(&assignment, "b"), vec![3, 4]);
        assert_eq!(ids(&assignment, "c"), vec![5, 6]);
    }

    #[test]
    fn more_instances_than_partitions() {
        let instances: Vec<String> = (0..5).map(|i| format!("inst-{i}")).collect();
        let assignment = assign_partitions(&instances, &partitions(2));

        assert_eq!(ids(&assignment, "inst-0"), vec![0]);
        assert_eq!(ids(&assignment, "inst-1"), vec![1]);
        for standby in 2..5 {
            assert!(assignment[&format!("inst-{standby}")].is_empty());
        }
    }

    #[test]
    fn single_instance_takes_everything() {
        let instances = vec!["only".to_string()];
        let assignment = assign_partitions(&instances, &partitions(5));
        assert_eq!(ids(&assignment, "only"), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_inputs() {
        assert!(assign_partitions(&[], &partitions(4)).is_empty());

        let instances = vec!["a".to_string()];
        let assignment = assign_partitions(&instances, &[]);
        assert!(assignment["a"].is_empty());
    }

    #[test]
    fn deterministic_regardless_of_input_order() {
        let sorted = vec!["alpha".to_string(), "middle".to_string(), "zebra".to_string()];
        let shuffled = vec!["zebra".to_string(), "alpha".to_string(), "middle".to_string()];

        let mut unsorted_partitions = partitions(7);
        unsorted_partitions.reverse();

        let first = assign_partitions(&sorted, &partitions(7));
        let second = assign_partitions(&shuffled, &unsorted_partitions);
        assert_eq!(first, second);
        assert_eq!(ids(&first, "alpha"), vec![0, 1, 2]);
        assert_eq!(ids(&first, "zebra"), vec![5, 6]);
    }

    #[test]
    fn complete_disjoint_and_balanced() {
        for instance_count in 1..6 {
            for partition_count in 0..12 {
                let instances: Vec<String> =
                    (0..instance_count).map(|i| format!("inst-{i}")).collect();
                let assignment = assign_partitions(&instances, &partitions(partition_count));

                let mut seen: Vec<i32> = assignment
                    .values()
                    .flat_map(|ps| ps.iter().map(|p| p.id))
                    .collect();
                seen.sort();
                let expected: Vec<i32> = (0..partition_count).collect();
                assert_eq!(seen, expected, "{instance_count} instances, {partition_count} partitions");

                let sizes: Vec<usize> = assignment.values().map(Vec::len).collect();
                let max = sizes.iter().max().copied().unwrap_or(0);
                let min = sizes.iter().min().copied().unwrap_or(0);
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn membership_change_moves_a_bounded_range() {
        let partitions = partitions(8);
        let two = vec!["a".to_string(), "b".to_string()];
        let three = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let before = assign_partitions(&two, &partitions);
        let after = assign_partitions(&three, &partitions);

        // 8 partitions over 2 instances means ceil(8/2) = 4 moves at most.
        let moved: usize = ["a", "b"]
            .iter()
            .map(|instance| {
                before[*instance]
                    .iter()
                    .filter(|p| !after[*instance].contains(p))
                    .count()
            })
            .sum();
        assert!(moved <= 4, "moved {moved} partitions");
    }
}
