//! Skyline rectangle packing for generated atlas pages.
//!
//! The packer places axis-aligned rectangles onto one fixed-size page,
//! never rotating them. Placement uses the bottom-left heuristic: each
//! rectangle goes wherever its top edge ends up lowest, ties broken
//! towards the left edge. Given the same insertion sequence the layout is
//! fully deterministic, which region emission depends on.

/// Packs rectangles onto a single page.
#[derive(Debug)]
pub struct PagePacker {
    width: u32,
    height: u32,
    skyline: Vec<Segment>,
}

/// One horizontal run of the skyline: the region `[x, x + width)` is
/// filled up to `y`.
#[derive(Debug, Clone, Copy)]
struct Segment {
    x: u32,
    y: u32,
    width: u32,
}

impl PagePacker {
    pub fn new(width: u32, height: u32) -> Self {
        PagePacker {
            width,
            height,
            skyline: vec![Segment { x: 0, y: 0, width }],
        }
    }

    /// Places a `width` by `height` rectangle, returning its top-left
    /// corner, or `None` if no position can hold it.
    pub fn insert(&mut self, width: u32, height: u32) -> Option<(u32, u32)> {
        let mut best: Option<(usize, u32, u32)> = None;

        for index in 0..self.skyline.len() {
            let y = match self.fit_at(index, width) {
                Some(y) => y,
                None => continue,
            };
            if y + height > self.height {
                continue;
            }

            let x = self.skyline[index].x;
            let better = match best {
                None => true,
                Some((_, best_x, best_y)) => y < best_y || (y == best_y && x < best_x),
            };
            if better {
                best = Some((index, x, y));
            }
        }

        let (index, x, y) = best?;
        self.place(index, x, y, width, height);
        Some((x, y))
    }

    /// The y coordinate a rectangle of `width` would rest at when placed
    /// at the left edge of segment `index`, or `None` if it would hang off
    /// the page.
    fn fit_at(&self, index: usize, width: u32) -> Option<u32> {
        let start = self.skyline[index];
        if start.x + width > self.width {
            return None;
        }

        let mut remaining = width;
        let mut rest_y = 0;
        let mut current = index;
        while remaining > 0 {
            let segment = self.skyline.get(current)?;
            rest_y = rest_y.max(segment.y);
            remaining = remaining.saturating_sub(segment.width);
            current += 1;
        }

        Some(rest_y)
    }

    fn place(&mut self, index: usize, x: u32, y: u32, width: u32, height: u32) {
        self.skyline.insert(
            index,
            Segment {
                x,
                y: y + height,
                width,
            },
        );

        // Consume the skyline the new segment shadows.
        let end = x + width;
        let mut current = index + 1;
        while current < self.skyline.len() {
            let segment = self.skyline[current];
            if segment.x >= end {
                break;
            }

            let covered = end - segment.x;
            if segment.width <= covered {
                self.skyline.remove(current);
            } else {
                self.skyline[current].x = end;
                self.skyline[current].width = segment.width - covered;
                break;
            }
        }

        // Merge runs that ended up level.
        let mut current = 0;
        while current + 1 < self.skyline.len() {
            if self.skyline[current].y == self.skyline[current + 1].y {
                self.skyline[current].width += self.skyline[current + 1].width;
                self.skyline.remove(current + 1);
            } else {
                current += 1;
            }
        }
    }
}
