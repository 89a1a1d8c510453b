use std::collections::VecDeque;

use logging_timer::time;
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};

use crate::{
    geo_utils::{degree_envelope, haversine_metres},
    model::Point,
};

/// A point's position and its index in the input slice.
#[derive(Debug, Clone, Copy)]
struct IndexedPosition {
    idx: usize,
    lat: f64,
    lon: f64,
}

impl RTreeObject for IndexedPosition {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lon, self.lat])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Unvisited,
    Noise,
    Cluster(usize),
}

/// Indices of every point within `eps_m` of each point, the point itself
/// included, in ascending order.
fn neighbourhoods(points: &[Point], eps_m: f64) -> Vec<Vec<usize>> {
    let tree = RTree::bulk_load(
        points
            .iter()
            .enumerate()
            .map(|(idx, p)| IndexedPosition {
                idx,
                lat: p.lat,
                lon: p.lon,
            })
            .collect(),
    );

    points
        .par_iter()
        .map(|p| {
            let (dlat, dlon) = degree_envelope(eps_m, p.lat);
            let search = AABB::from_corners([p.lon - dlon, p.lat - dlat], [p.lon + dlon, p.lat + dlat]);
            let mut found: Vec<usize> = tree
                .locate_in_envelope(&search)
                .filter(|q| haversine_metres(p.lat, p.lon, q.lat, q.lon) <= eps_m)
                .map(|q| q.idx)
                .collect();
            found.sort_unstable();
            found
        })
        .collect()
}

/// Clusters the points with DBSCAN. Returns the cluster number of each
/// point, or `None` for noise. A point is a core point when at least
/// `min_points` points (itself included) lie within `eps_m` of it.
/// Cluster numbers are assigned in order of each cluster's first point.
#[time]
pub fn dbscan(points: &[Point], eps_m: f64, min_points: usize) -> Vec<Option<usize>> {
    let neighbours = neighbourhoods(points, eps_m);
    let mut labels = vec![Label::Unvisited; points.len()];
    let mut next_cluster = 0;

    for i in 0..points.len() {
        if labels[i] != Label::Unvisited {
            continue;
        }
        if neighbours[i].len() < min_points {
            labels[i] = Label::Noise;
            continue;
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[i] = Label::Cluster(cluster);

        let mut queue: VecDeque<usize> = neighbours[i].iter().copied().collect();
        while let Some(j) = queue.pop_front() {
            match labels[j] {
                Label::Noise => labels[j] = Label::Cluster(cluster),
                Label::Unvisited => {
                    labels[j] = Label::Cluster(cluster);
                    if neighbours[j].len() >= min_points {
                        queue.extend(neighbours[j].iter().copied());
                    }
                }
                Label::Cluster(_) => {}
            }
        }
    }

    labels
        .into_iter()
        .map(|label| match label {
            Label::Cluster(c) => Some(c),
            _ => None,
        })
        .collect()
}

/// Splits clusters into visits. The points must be in time order. Walking
/// the clustered points in order (noise is ignored), a visit ends when the
/// next clustered point belongs to another cluster, or when it is more than
/// `max_gap_s` after the previous member. Visits therefore never overlap in
/// time. Returns the member indices of each visit, in time order.
pub fn split_visits(points: &[Point], labels: &[Option<usize>], max_gap_s: i64) -> Vec<Vec<usize>> {
    let mut visits: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_label = None;

    for (idx, label) in labels.iter().enumerate() {
        let Some(label) = label else {
            continue;
        };

        let continues = match (current_label, current.last()) {
            (Some(c), Some(&prev)) => {
                c == *label && points[idx].timestamp - points[prev].timestamp <= max_gap_s
            }
            _ => false,
        };

        if !continues && !current.is_empty() {
            visits.push(std::mem::take(&mut current));
        }
        current.push(idx);
        current_label = Some(*label);
    }

    if !current.is_empty() {
        visits.push(current);
    }

    visits
}
