//! View pairing strategies ("scene graphs") for the pairwise stereo model.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::DataError;

const DEFAULT_WINDOW: usize = 3;
/// Largest `swin` window.
pub const MAX_WINDOW: usize = 1024;
/// Largest `logwin` window; offsets reach `2^(size-1)`.
pub const MAX_LOG_WINDOW: usize = 32;

/// How views of one sample are paired before inference.
///
/// Parsed from `complete`, `swin[-k][-noncyclic]`, `logwin[-k][-noncyclic]`
/// and `oneref[-r]`.
///
/// No graph pairs a view with itself. When a cyclic window wraps around onto
/// the view it started from (a window at least as large as the view count),
/// that `(i, i)` candidate is dropped rather than kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SceneGraph {
    /// Every unordered pair of distinct views.
    #[default]
    Complete,
    /// Each view with its next `size` neighbours.
    SlidingWindow { size: usize, cyclic: bool },
    /// Each view with neighbours at offsets 1, 2, 4, .. 2^(size-1) on both sides.
    LogWindow { size: usize, cyclic: bool },
    /// Every view with the reference view.
    OneRef { reference: usize },
}

impl SceneGraph {
    /// Ordered view-index pairs for `num_views` views.
    ///
    /// Every pair `(a, b)` is followed later in the list by `(b, a)`.
    pub fn make_pairs(&self, num_views: usize) -> Result<Vec<(usize, usize)>, DataError> {
        let mut pairs = match *self {
            SceneGraph::Complete => (0..num_views)
                .flat_map(|i| (0..i).map(move |j| (i, j)))
                .collect::<Vec<_>>(),
            SceneGraph::SlidingWindow { size, cyclic } => {
                check_window(size, MAX_WINDOW)?;
                let offsets: Vec<usize> = (1..=size).collect();
                windowed(num_views, &offsets, cyclic, false)
            }
            SceneGraph::LogWindow { size, cyclic } => {
                check_window(size, MAX_LOG_WINDOW)?;
                let offsets: Vec<usize> = (0..size).map(|i| 1usize << i).collect();
                windowed(num_views, &offsets, cyclic, true)
            }
            SceneGraph::OneRef { reference } => {
                if reference >= num_views {
                    return Err(DataError::InvalidConfig(format!(
                        "reference view {} out of range for {} views",
                        reference, num_views
                    )));
                }
                (0..num_views)
                    .filter(|&j| j != reference)
                    .map(|j| (reference, j))
                    .collect()
            }
        };

        let mirrored: Vec<(usize, usize)> = pairs.iter().map(|&(a, b)| (b, a)).collect();
        pairs.extend(mirrored);
        Ok(pairs)
    }
}

/// Unordered neighbour pairs, `(low, high)`, in ascending order.
fn windowed(num_views: usize, offsets: &[usize], cyclic: bool, both_sides: bool) -> Vec<(usize, usize)> {
    let n = num_views as i64;
    let mut unique = BTreeSet::new();
    for i in 0..n {
        let forward = offsets.iter().map(|&o| i + o as i64);
        let backward = offsets.iter().map(|&o| i - o as i64);
        let candidates: Vec<i64> = if both_sides {
            backward.chain(forward).collect()
        } else {
            forward.collect()
        };
        for mut j in candidates {
            if cyclic {
                j = j.rem_euclid(n);
            }
            if j < 0 || j >= n || j == i {
                continue;
            }
            unique.insert((i.min(j) as usize, i.max(j) as usize));
        }
    }
    unique.into_iter().collect()
}

fn check_window(size: usize, max: usize) -> Result<(), DataError> {
    if size > max {
        return Err(DataError::InvalidConfig(format!(
            "window size {} exceeds the maximum of {}",
            size, max
        )));
    }
    Ok(())
}

/// Window size from the second `-` separated token, or the default when that
/// token is not a number.
fn window_size(s: &str, tokens: &[&str], max: usize) -> Result<usize, DataError> {
    let size = match tokens.get(1) {
        Some(t) if !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit()) => t
            .parse()
            .map_err(|_| DataError::UnknownSceneGraph(s.to_string()))?,
        _ => DEFAULT_WINDOW,
    };
    check_window(size, max)?;
    Ok(size)
}

impl FromStr for SceneGraph {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split('-').collect();
        let cyclic = !s.ends_with("noncyclic");
        match tokens[0] {
            "complete" if tokens.len() == 1 => Ok(SceneGraph::Complete),
            "swin" => Ok(SceneGraph::SlidingWindow {
                size: window_size(s, &tokens, MAX_WINDOW)?,
                cyclic,
            }),
            "logwin" => Ok(SceneGraph::LogWindow {
                size: window_size(s, &tokens, MAX_LOG_WINDOW)?,
                cyclic,
            }),
            "oneref" => {
                let reference = match tokens.get(1) {
                    Some(t) => t
                        .parse()
                        .map_err(|_| DataError::UnknownSceneGraph(s.to_string()))?,
                    None => 0,
                };
                Ok(SceneGraph::OneRef { reference })
            }
            _ => Err(DataError::UnknownSceneGraph(s.to_string())),
        }
    }
}

impl fmt::Display for SceneGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = |cyclic: bool| if cyclic { "" } else { "-noncyclic" };
        match self {
            SceneGraph::Complete => write!(f, "complete"),
            SceneGraph::SlidingWindow { size, cyclic } => write!(f, "swin-{}{}", size, suffix(*cyclic)),
            SceneGraph::LogWindow { size, cyclic } => write!(f, "logwin-{}{}", size, suffix(*cyclic)),
            SceneGraph::OneRef { reference } => write!(f, "oneref-{}", reference),
        }
    }
}
