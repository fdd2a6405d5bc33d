//! Selecting suspicious locations and ordering them for review.

use itertools::Itertools;

use crate::config::{Options, SortOrder};
use crate::matcher::DetectionLocation;
use crate::num::TotalF32;

/// Keeps only the locations that recurred often enough to be suspicious.
pub fn select_suspicious(
    candidates: Vec<DetectionLocation>,
    occurrence_threshold: usize,
) -> Vec<DetectionLocation> {
    candidates
        .into_iter()
        .filter(|location| location.instances.len() >= occurrence_threshold)
        .collect()
}

/// Reorders a directory's suspicious locations so nearby detections sit next
/// to each other, for faster visual review.
///
/// Strictly cosmetic: the set of locations is unchanged, only the order (and,
/// for the cluster sort, the `cluster_label` field) is touched.
pub fn sort_for_review(locations: &mut [DetectionLocation], options: &Options) {
    if locations.len() <= 1 {
        return;
    }

    match options.sort_order {
        SortOrder::None => {}
        SortOrder::XSort => {
            locations.sort_by_key(|location| TotalF32(location.bbox.x_center()));
        }
        SortOrder::ClusterSort => {
            cluster_sort(locations, options.cluster_distance_threshold);
        }
    }
}

/// Complete-linkage agglomerative clustering over box centers, with cluster
/// labels renumbered left to right by mean x, then a `(label, id)` sort.
fn cluster_sort(locations: &mut [DetectionLocation], distance_threshold: f32) {
    let points = locations
        .iter()
        .map(|location| [location.bbox.x_center(), location.bbox.y_center()])
        .collect::<Vec<_>>();
    let labels = complete_linkage_labels(&points, distance_threshold);

    // Rank raw labels by the mean x of their members' top-left corners, so
    // labels are sortable left to right.
    let label_count = labels.iter().max().map_or(0, |&label| label + 1);
    let mut x_sum = vec![0.0f32; label_count];
    let mut count = vec![0usize; label_count];
    for (location, &label) in locations.iter().zip(&labels) {
        x_sum[label] += location.bbox.x();
        count[label] += 1;
    }
    let ranked = (0..label_count)
        .sorted_by_key(|&label| TotalF32(x_sum[label] / count[label] as f32))
        .collect::<Vec<_>>();
    let mut renumbered = vec![0usize; label_count];
    for (rank, &label) in ranked.iter().enumerate() {
        renumbered[label] = rank;
    }

    for (location, label) in locations.iter_mut().zip(labels) {
        location.cluster_label = Some(renumbered[label]);
    }
    locations.sort_by_key(|location| (location.cluster_label, location.id));
}

/// Assigns each point a cluster label by merging clusters while the smallest
/// complete-linkage (maximum pairwise) distance stays below the threshold.
fn complete_linkage_labels(points: &[[f32; 2]], distance_threshold: f32) -> Vec<usize> {
    let distance = |a: [f32; 2], b: [f32; 2]| (a[0] - b[0]).hypot(a[1] - b[1]);

    let mut clusters = (0..points.len()).map(|i| vec![i]).collect::<Vec<_>>();
    loop {
        let mut best: Option<(usize, usize, f32)> = None;
        for i in 0..clusters.len() {
            for j in i + 1..clusters.len() {
                let linkage = clusters[i]
                    .iter()
                    .cartesian_product(&clusters[j])
                    .map(|(&a, &b)| distance(points[a], points[b]))
                    .fold(0.0f32, f32::max);
                if best.is_none_or(|(_, _, d)| linkage < d) {
                    best = Some((i, j, linkage));
                }
            }
        }

        match best {
            Some((i, j, linkage)) if linkage < distance_threshold => {
                let merged = clusters.swap_remove(j);
                clusters[i].extend(merged);
            }
            _ => break,
        }
    }

    let mut labels = vec![0usize; points.len()];
    for (label, members) in clusters.iter().enumerate() {
        for &point in members {
            labels[point] = label;
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SortOrder;
    use crate::test::{location, options};

    #[test]
    fn occurrence_threshold_is_inclusive() {
        let mut opts = options();
        opts.occurrence_threshold = 3;

        let candidates = vec![
            location("dir", 0, [0.1, 0.1, 0.1, 0.1], 3),
            location("dir", 1, [0.3, 0.3, 0.1, 0.1], 2),
        ];
        let selected = select_suspicious(candidates, opts.occurrence_threshold);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, 0);
    }

    #[test]
    fn xsort_orders_left_to_right() {
        let mut locations = vec![
            location("dir", 0, [0.6, 0.1, 0.1, 0.1], 5),
            location("dir", 1, [0.1, 0.1, 0.1, 0.1], 5),
            location("dir", 2, [0.3, 0.1, 0.1, 0.1], 5),
        ];
        let mut opts = options();
        opts.sort_order = SortOrder::XSort;
        sort_for_review(&mut locations, &opts);
        let ids = locations.iter().map(|l| l.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 0]);
    }

    #[test]
    fn cluster_sort_groups_nearby_boxes() {
        // Two tight groups, far apart; the right-hand group comes first in
        // discovery order to prove labels are renumbered by x position.
        let mut locations = vec![
            location("dir", 0, [0.80, 0.50, 0.02, 0.02], 5),
            location("dir", 1, [0.81, 0.50, 0.02, 0.02], 5),
            location("dir", 2, [0.10, 0.50, 0.02, 0.02], 5),
            location("dir", 3, [0.11, 0.50, 0.02, 0.02], 5),
        ];
        let mut opts = options();
        opts.sort_order = SortOrder::ClusterSort;
        opts.cluster_distance_threshold = 0.1;
        sort_for_review(&mut locations, &opts);

        let ids = locations.iter().map(|l| l.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 3, 0, 1]);
        assert_eq!(locations[0].cluster_label, Some(0));
        assert_eq!(locations[1].cluster_label, Some(0));
        assert_eq!(locations[2].cluster_label, Some(1));
        assert_eq!(locations[3].cluster_label, Some(1));
    }

    #[test]
    fn ordering_never_changes_the_selected_set() {
        let candidates = vec![
            location("dir", 0, [0.6, 0.1, 0.1, 0.1], 4),
            location("dir", 1, [0.1, 0.1, 0.1, 0.1], 4),
            location("dir", 2, [0.3, 0.1, 0.1, 0.1], 1),
        ];

        let mut baseline: Option<Vec<usize>> = None;
        for sort_order in [SortOrder::None, SortOrder::XSort, SortOrder::ClusterSort] {
            let mut opts = options();
            opts.sort_order = sort_order;
            opts.occurrence_threshold = 2;

            let mut selected = select_suspicious(candidates.clone(), opts.occurrence_threshold);
            sort_for_review(&mut selected, &opts);

            let mut ids = selected.iter().map(|l| l.id).collect::<Vec<_>>();
            ids.sort_unstable();
            match &baseline {
                Some(expected) => assert_eq!(&ids, expected),
                None => baseline = Some(ids),
            }
        }
    }
}
