use super::Descriptor;

/// Correspondence between descriptor `query_idx` of the query set and
/// descriptor `train_idx` of the train set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

/// Exhaustive nearest-neighbour matcher under the Hamming distance.
#[derive(Debug, Clone, Default)]
pub struct BruteForceMatcher {
    cross_check: bool,
}

impl BruteForceMatcher {
    pub fn new() -> Self {
        Self { cross_check: false }
    }

    /// Keep a match only if each descriptor is the other's nearest neighbour.
    pub fn with_cross_check(mut self) -> Self {
        self.cross_check = true;
        self
    }

    /// Finds the nearest train descriptor for every query descriptor.
    pub fn match_descriptors(&self, query: &[Descriptor], train: &[Descriptor]) -> Vec<FeatureMatch> {
        if query.is_empty() || train.is_empty() {
            return Vec::new();
        }

        let reverse: Option<Vec<usize>> = self.cross_check.then(|| {
            train
                .iter()
                .filter_map(|t| nearest(t, query).map(|(idx, _)| idx))
                .collect()
        });

        query
            .iter()
            .enumerate()
            .filter_map(|(query_idx, q)| {
                let (train_idx, distance) = nearest(q, train)?;
                if let Some(reverse) = &reverse {
                    if reverse[train_idx] != query_idx {
                        return None;
                    }
                }
                Some(FeatureMatch {
                    query_idx,
                    train_idx,
                    distance,
                })
            })
            .collect()
    }
}

/// Index and distance of the closest candidate; the first one wins ties.
fn nearest(descriptor: &Descriptor, candidates: &[Descriptor]) -> Option<(usize, u32)> {
    candidates
        .iter()
        .enumerate()
        .map(|(idx, c)| (idx, descriptor.hamming_distance(c)))
        .min_by_key(|&(idx, distance)| (distance, idx))
}

/// Drops matches farther than `max_distance`.
pub fn filter_matches_by_distance(matches: &[FeatureMatch], max_distance: u32) -> Vec<FeatureMatch> {
    matches
        .iter()
        .filter(|m| m.distance <= max_distance)
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(ones: &[usize]) -> Descriptor {
        let mut bytes = [0u8; 32];
        for &bit in ones {
            bytes[bit / 8] |= 1 << (bit % 8);
        }
        Descriptor(bytes)
    }

    #[test]
    fn test_nearest_neighbour() {
        let train = vec![descriptor(&[0, 1, 2]), descriptor(&[100, 101]), descriptor(&[])];
        let query = vec![descriptor(&[100]), descriptor(&[0, 1])];
        let matches = BruteForceMatcher::new().match_descriptors(&query, &train);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].train_idx, 2);
        assert_eq!(matches[0].distance, 1);
        assert_eq!(matches[1].train_idx, 0);
        assert_eq!(matches[1].distance, 1);
    }

    #[test]
    fn test_cross_check_drops_one_sided_matches() {
        // both queries are closest to train 0, but train 0 prefers query 1
        let train = vec![descriptor(&[0, 1, 2, 3])];
        let query = vec![descriptor(&[0, 1]), descriptor(&[0, 1, 2])];
        let plain = BruteForceMatcher::new().match_descriptors(&query, &train);
        assert_eq!(plain.len(), 2);

        let checked = BruteForceMatcher::new().with_cross_check().match_descriptors(&query, &train);
        assert_eq!(checked.len(), 1);
        assert_eq!(checked[0].query_idx, 1);
    }

    #[test]
    fn test_empty_inputs() {
        let matcher = BruteForceMatcher::new().with_cross_check();
        assert!(matcher.match_descriptors(&[], &[descriptor(&[1])]).is_empty());
        assert!(matcher.match_descriptors(&[descriptor(&[1])], &[]).is_empty());
    }

    #[test]
    fn test_filter_by_distance() {
        let matches = vec![
            FeatureMatch { query_idx: 0, train_idx: 0, distance: 3 },
            FeatureMatch { query_idx: 1, train_idx: 1, distance: 30 },
        ];
        let kept = filter_matches_by_distance(&matches, 20);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].distance, 3);
    }
}
