//! Image tiles and rank striping.

/// A rectangular region of the image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tile {
    /// Left pixel column.
    pub x: i32,

    /// Bottom pixel row.
    pub y: i32,

    /// Width in pixels.
    pub w: i32,

    /// Height in pixels.
    pub h: i32,
}

impl Tile {
    /// Create a tile.
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// Returns true if the tile covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// Number of pixels covered.
    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.w as i64 * self.h as i64
        }
    }
}

/// Assign a rank its horizontal stripe of an image tile. Rows are divided as
/// evenly as possible; the first `h % nranks` ranks take one extra row.
///
/// * `nranks` - Number of ranks.
/// * `rank`   - This rank.
/// * `image`  - The full tile being striped.
pub fn stripe(nranks: i32, rank: i32, image: Tile) -> Tile {
    let base = image.h / nranks;
    let extra = image.h % nranks;
    let h = base + i32::from(rank < extra);
    let y = image.y + rank * base + rank.min(extra);
    Tile::new(image.x, y, image.w, h)
}

/// Assign a rank its image region: a plain row stripe when the requested
/// tile count does not exceed the rank count, otherwise a round-robin share
/// of the global tile list.
///
/// * `cfg`    - Application options.
/// * `nranks` - Number of ranks.
/// * `rank`   - This rank.
pub fn assign_tiles(cfg: &crate::app::Options, nranks: i32, rank: i32) -> Vec<Tile> {
    let image = Tile::new(0, 0, cfg.width as i32, cfg.height as i32);
    if cfg.num_tiles <= nranks {
        let t = stripe(nranks, rank, image);
        if t.is_empty() {
            Vec::new()
        } else {
            vec![t]
        }
    } else {
        TileList::new(image.w, image.h, cfg.num_tiles, cfg.min_tile_size)
            .tiles()
            .iter()
            .enumerate()
            .filter(|(i, _)| (*i as i32) % nranks == rank)
            .map(|(_, t)| *t)
            .collect()
    }
}

/// Split an image into a row-major list of square-ish tiles.
///
/// The tile edge is chosen so at least `num_tiles` tiles are produced, but
/// never smaller than `min_tile_size` pixels on a side.
pub struct TileList {
    tiles: Vec<Tile>,
}

impl TileList {
    /// Build the list.
    ///
    /// * `w`             - Image width.
    /// * `h`             - Image height.
    /// * `num_tiles`     - Requested minimum number of tiles.
    /// * `min_tile_size` - Lower bound on the tile edge in pixels.
    pub fn new(w: i32, h: i32, num_tiles: i32, min_tile_size: i32) -> Self {
        let num_tiles = num_tiles.max(1);
        let min_tile_size = min_tile_size.max(1);

        let mut edge = (((w as f64 * h as f64) / num_tiles as f64).sqrt() as i32).max(1);
        edge = edge.max(min_tile_size).min(w.max(1)).min(h.max(1));

        let mut tiles = Vec::new();
        let mut y = 0;
        while y < h {
            let th = edge.min(h - y);
            let mut x = 0;
            while x < w {
                let tw = edge.min(w - x);
                tiles.push(Tile::new(x, y, tw, th));
                x += edge;
            }
            y += edge;
        }
        Self { tiles }
    }

    /// The tiles, row-major.
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Number of tiles.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// Returns true if the image was empty.
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripes_cover_image_disjointly() {
        let image = Tile::new(0, 0, 64, 37);
        let mut rows = 0;
        let mut next_y = 0;
        for rank in 0..5 {
            let t = stripe(5, rank, image);
            assert_eq!(t.x, 0);
            assert_eq!(t.w, 64);
            assert_eq!(t.y, next_y);
            next_y += t.h;
            rows += t.h;
        }
        assert_eq!(rows, 37);
    }

    #[test]
    fn single_rank_takes_all() {
        let image = Tile::new(0, 0, 8, 8);
        assert_eq!(stripe(1, 0, image), image);
    }

    #[test]
    fn more_ranks_than_rows() {
        let image = Tile::new(0, 0, 4, 2);
        let populated: i32 = (0..4).map(|r| i32::from(!stripe(4, r, image).is_empty())).sum();
        assert_eq!(populated, 2);
    }

    #[test]
    fn tile_list_covers_image() {
        let list = TileList::new(100, 60, 7, 8);
        assert!(list.len() >= 7);
        let area: i64 = list.tiles().iter().map(|t| t.area()).sum();
        assert_eq!(area, 100 * 60);
    }

    #[test]
    fn rank_assignment_covers_image_exactly_once() {
        use clap::Parser;
        let cfg = crate::app::Options::parse_from([
            "distray", "s", "--width", "32", "--height", "32", "--num-tiles", "9",
            "--min-tile-size", "4",
        ]);
        let mut area = 0;
        for rank in 0..3 {
            for t in assign_tiles(&cfg, 3, rank) {
                area += t.area();
            }
        }
        assert_eq!(area, 32 * 32);

        // the default single-tile request degenerates to rank stripes
        let cfg = crate::app::Options::parse_from(["distray", "s", "--width", "8", "--height", "8"]);
        let tiles = assign_tiles(&cfg, 2, 1);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].h, 4);
    }

    #[test]
    fn tile_list_respects_min_size() {
        let list = TileList::new(64, 64, 1024, 16);
        for t in list.tiles() {
            // only edge tiles may be clipped below the minimum
            assert!(t.w >= 16 || t.x + t.w == 64);
            assert!(t.h >= 16 || t.y + t.h == 64);
        }
    }
}
