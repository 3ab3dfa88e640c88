//! External contour extraction from binary images.
//!
//! Foreground is 8-connected and background 4-connected. A component is
//! external when it touches the background region that surrounds the image;
//! components sitting inside another component's hole are skipped. The
//! boundary of each external component is traced with Moore-neighbour
//! tracing, clockwise in image coordinates, starting at its first pixel in
//! raster order.

use std::collections::VecDeque;

use ndarray::{Array2, ArrayView2};

use super::thresholding::connected_components;

/// Neighbour offsets as (dx, dy), clockwise on screen starting east.
const DIRECTIONS: [(isize, isize); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

const WEST: usize = 4;

/// Traced outer boundary of one foreground component.
#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    points: Vec<[f64; 2]>,
    area: f64,
    pixel_count: usize,
}

impl Contour {
    /// Boundary pixel centres as `[x, y]`, in tracing order.
    pub fn points(&self) -> &[[f64; 2]] {
        &self.points
    }

    /// Polygon area enclosed by the boundary (shoelace formula).
    pub fn area(&self) -> f64 {
        self.area
    }

    /// Number of foreground pixels in the component.
    pub fn pixel_count(&self) -> usize {
        self.pixel_count
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Find the outer boundaries of all external components.
///
/// Non-zero pixels are foreground. Contours are returned in raster order of
/// their starting pixel.
pub fn external_contours(binary: &ArrayView2<u8>) -> Vec<Contour> {
    let (height, width) = binary.dim();
    if height == 0 || width == 0 {
        return Vec::new();
    }

    let labels = connected_components(binary);
    let component_count = labels.iter().copied().max().unwrap_or(0);
    if component_count == 0 {
        return Vec::new();
    }

    let outer = outer_background(&labels);

    let mut external = vec![false; component_count + 1];
    let mut pixel_counts = vec![0usize; component_count + 1];
    let mut starts: Vec<Option<(usize, usize)>> = vec![None; component_count + 1];

    for ((row, col), &label) in labels.indexed_iter() {
        if label == 0 {
            continue;
        }
        pixel_counts[label] += 1;
        if starts[label].is_none() {
            starts[label] = Some((row, col));
        }
        if !external[label] && touches_outer(&outer, row, col) {
            external[label] = true;
        }
    }

    let mut contours: Vec<((usize, usize), Contour)> = (1..=component_count)
        .filter(|&label| external[label])
        .filter_map(|label| {
            let start = starts[label]?;
            let points = trace_boundary(&labels, label, start);
            let area = polygon_area(&points);
            Some((
                start,
                Contour {
                    points,
                    area,
                    pixel_count: pixel_counts[label],
                },
            ))
        })
        .collect();

    contours.sort_by_key(|(start, _)| *start);
    contours.into_iter().map(|(_, contour)| contour).collect()
}

/// Background pixels 4-connected to the area outside the image.
fn outer_background(labels: &Array2<usize>) -> Array2<bool> {
    let (height, width) = labels.dim();
    let mut outer = Array2::from_elem((height, width), false);
    let mut queue = VecDeque::new();

    let mut seed = |row: usize, col: usize, outer: &mut Array2<bool>| {
        if labels[[row, col]] == 0 && !outer[[row, col]] {
            outer[[row, col]] = true;
            queue.push_back((row, col));
        }
    };

    for col in 0..width {
        seed(0, col, &mut outer);
        seed(height - 1, col, &mut outer);
    }
    for row in 0..height {
        seed(row, 0, &mut outer);
        seed(row, width - 1, &mut outer);
    }

    while let Some((row, col)) = queue.pop_front() {
        let neighbours = [
            (row.wrapping_sub(1), col),
            (row + 1, col),
            (row, col.wrapping_sub(1)),
            (row, col + 1),
        ];
        for (r, c) in neighbours {
            if r < height && c < width && labels[[r, c]] == 0 && !outer[[r, c]] {
                outer[[r, c]] = true;
                queue.push_back((r, c));
            }
        }
    }

    outer
}

fn touches_outer(outer: &Array2<bool>, row: usize, col: usize) -> bool {
    let (height, width) = outer.dim();
    if row == 0 || col == 0 || row + 1 == height || col + 1 == width {
        return true;
    }
    outer[[row - 1, col]] || outer[[row + 1, col]] || outer[[row, col - 1]] || outer[[row, col + 1]]
}

fn is_member(labels: &Array2<usize>, label: usize, x: isize, y: isize) -> bool {
    let (height, width) = labels.dim();
    x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height
        && labels[[y as usize, x as usize]] == label
}

fn direction_index(dx: isize, dy: isize) -> usize {
    DIRECTIONS
        .iter()
        .position(|&d| d == (dx, dy))
        .unwrap_or(WEST)
}

/// Moore-neighbour tracing.
///
/// `start` is the first pixel of the component in raster order, so its west
/// neighbour is background. Tracing stops when the walk re-enters the start
/// pixel and is about to repeat its first step.
fn trace_boundary(labels: &Array2<usize>, label: usize, start: (usize, usize)) -> Vec<[f64; 2]> {
    let start = (start.1 as isize, start.0 as isize);
    let mut points = vec![[start.0 as f64, start.1 as f64]];

    let step = |current: (isize, isize), backtrack: usize| -> Option<((isize, isize), usize)> {
        for k in 1..=8 {
            let d = (backtrack + k) % 8;
            let (dx, dy) = DIRECTIONS[d];
            let candidate = (current.0 + dx, current.1 + dy);
            if is_member(labels, label, candidate.0, candidate.1) {
                // last background neighbour examined, seen from the new pixel
                let (bx, by) = DIRECTIONS[(d + 7) % 8];
                let back = direction_index(
                    current.0 + bx - candidate.0,
                    current.1 + by - candidate.1,
                );
                return Some((candidate, back));
            }
        }
        None
    };

    let Some((first, mut backtrack)) = step(start, WEST) else {
        return points;
    };

    let mut current = first;
    // a component has at most 4 boundary visits per pixel
    let limit = 4 * labels.len() + 8;
    for _ in 0..limit {
        let Some((next, next_backtrack)) = step(current, backtrack) else {
            break;
        };
        if current == start && next == first {
            break;
        }
        points.push([current.0 as f64, current.1 as f64]);
        current = next;
        backtrack = next_backtrack;
    }

    points
}

/// Shoelace area of a closed polygon.
pub(crate) fn polygon_area(points: &[[f64; 2]]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: f64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a[0] * b[1] - b[0] * a[1])
        .sum();
    twice.abs() / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn filled_rect(height: usize, width: usize, rows: (usize, usize), cols: (usize, usize)) -> Array2<u8> {
        let mut image = Array2::zeros((height, width));
        for r in rows.0..rows.1 {
            for c in cols.0..cols.1 {
                image[[r, c]] = 255;
            }
        }
        image
    }

    #[test]
    fn test_square_boundary_and_area() {
        // 5x5 block of pixels; pixel-centre polygon is 4x4
        let image = filled_rect(10, 10, (2, 7), (3, 8));
        let contours = external_contours(&image.view());

        assert_eq!(contours.len(), 1);
        let contour = &contours[0];
        assert_eq!(contour.len(), 16);
        assert_eq!(contour.pixel_count(), 25);
        assert_relative_eq!(contour.area(), 16.0);
        assert_eq!(contour.points()[0], [3.0, 2.0]);
        // clockwise on screen: first step goes east
        assert_eq!(contour.points()[1], [4.0, 2.0]);
    }

    #[test]
    fn test_single_pixel_and_line() {
        let mut image = Array2::zeros((5, 5));
        image[[2, 2]] = 255u8;
        let contours = external_contours(&image.view());
        assert_eq!(contours.len(), 1);
        assert_eq!(contours[0].len(), 1);
        assert_eq!(contours[0].area(), 0.0);

        let line = filled_rect(5, 8, (2, 3), (1, 6));
        let contours = external_contours(&line.view());
        assert_eq!(contours.len(), 1);
        // out along the line and back
        assert_eq!(contours[0].len(), 8);
        assert_eq!(contours[0].area(), 0.0);
    }

    #[test]
    fn test_component_inside_hole_is_not_external() {
        let mut ring = filled_rect(20, 20, (2, 18), (2, 18));
        for r in 5..15 {
            for c in 5..15 {
                ring[[r, c]] = 0;
            }
        }
        // island inside the hole
        for r in 8..12 {
            for c in 8..12 {
                ring[[r, c]] = 255;
            }
        }

        let contours = external_contours(&ring.view());
        assert_eq!(contours.len(), 1);
        assert_relative_eq!(contours[0].area(), 15.0 * 15.0);
    }

    #[test]
    fn test_border_touching_component_is_external() {
        let image = filled_rect(6, 6, (0, 3), (0, 3));
        let contours = external_contours(&image.view());
        assert_eq!(contours.len(), 1);
        assert_relative_eq!(contours[0].area(), 4.0);
    }

    #[test]
    fn test_contours_in_raster_order() {
        let mut image = filled_rect(20, 20, (10, 15), (2, 6));
        for r in 2..5 {
            for c in 12..18 {
                image[[r, c]] = 255;
            }
        }
        let contours = external_contours(&image.view());
        assert_eq!(contours.len(), 2);
        assert_eq!(contours[0].points()[0], [12.0, 2.0]);
        assert_eq!(contours[1].points()[0], [2.0, 10.0]);
    }

    #[test]
    fn test_empty_image_has_no_contours() {
        let image = Array2::<u8>::zeros((4, 4));
        assert!(external_contours(&image.view()).is_empty());
    }
}
