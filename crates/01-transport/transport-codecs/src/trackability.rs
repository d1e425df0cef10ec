//! Trackability payload: a nine-word header, two gradient planes and the
//! result stream, all in one buffer.
//!
//! ```text
//! word 0..9        header (see `field`)
//! word 9..         plane A: gradient-x, row-major, fixed point
//! word field[7]..  plane B: gradient-y, row-major, fixed point
//! word field[8]..  results, one per processed pixel
//! ```
//!
//! The co-processor owns a band of `rows` image rows starting at
//! `first_row`. The planes carry that band plus `window_hh` halo rows above
//! and below, so plane row `window_hh` is image row `first_row`. After the
//! kernel runs, field 8 holds the offset one past the last result written.

use crate::words::{Words, WordsMut, WORD_BYTES};
use crate::{CodecError, CodecResult};

pub const HEADER_WORDS: usize = 9;

/// Header word indices.
pub mod field {
    pub const ROWS: usize = 0;
    pub const COLS: usize = 1;
    pub const ROWS_DSP: usize = 2;
    pub const WINDOW_HH: usize = 3;
    pub const WINDOW_HW: usize = 4;
    pub const BORDER_X: usize = 5;
    pub const BORDER_Y: usize = 6;
    pub const PLANE_B: usize = 7;
    pub const RESULTS: usize = 8;
}

/// Offset of plane A; fixed by the header size.
pub const PLANE_A: usize = HEADER_WORDS;

/// Image dimensions and window parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub rows: usize,
    pub cols: usize,
    pub window_hh: usize,
    pub window_hw: usize,
    pub border_x: usize,
    pub border_y: usize,
}

/// Band of image rows assigned to the co-processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    pub first_row: usize,
    pub rows: usize,
}

impl Partition {
    /// Every row not excluded by the border or the window halo.
    pub fn whole(geometry: &Geometry) -> Self {
        let first_row = geometry.border_y.max(geometry.window_hh);
        Self {
            first_row,
            rows: geometry.rows.saturating_sub(2 * first_row),
        }
    }

    /// The first `rows` rows after the top margin.
    pub fn leading(geometry: &Geometry, rows: usize) -> Self {
        Self {
            first_row: geometry.border_y.max(geometry.window_hh),
            rows,
        }
    }
}

/// Validated placement of one payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    geometry: Geometry,
    partition: Partition,
    plane_len: usize,
    result_count: usize,
}

impl Layout {
    pub fn new(geometry: Geometry, partition: Partition) -> CodecResult<Self> {
        let Geometry {
            rows,
            cols,
            window_hh,
            window_hw,
            border_x,
            ..
        } = geometry;

        if rows == 0 || cols == 0 {
            return Err(CodecError::InvalidGeometry("image is empty"));
        }
        if border_x < window_hw || cols <= 2 * border_x {
            return Err(CodecError::InvalidGeometry(
                "columns must cover the x border on both sides",
            ));
        }
        if partition.rows == 0 {
            return Err(CodecError::InvalidGeometry("partition has no rows"));
        }
        if partition.first_row < window_hh || partition.first_row + partition.rows + window_hh > rows
        {
            return Err(CodecError::InvalidGeometry(
                "partition and its window halo must lie inside the image",
            ));
        }
        if rows > i32::MAX as usize || cols > i32::MAX as usize {
            return Err(CodecError::InvalidGeometry("dimensions exceed a 32-bit field"));
        }

        let plane_len = (partition.rows + 2 * window_hh) * cols;
        let result_count = partition.rows * (cols - 2 * border_x);
        Ok(Self {
            geometry,
            partition,
            plane_len,
            result_count,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Samples per gradient plane.
    pub fn plane_len(&self) -> usize {
        self.plane_len
    }

    pub fn plane_b(&self) -> usize {
        PLANE_A + self.plane_len
    }

    pub fn results(&self) -> usize {
        self.plane_b() + self.plane_len
    }

    pub fn result_count(&self) -> usize {
        self.result_count
    }

    pub fn words(&self) -> usize {
        self.results() + self.result_count
    }

    pub fn bytes(&self) -> usize {
        self.words() * WORD_BYTES
    }

    fn header(&self) -> [i32; HEADER_WORDS] {
        let g = &self.geometry;
        [
            g.rows as i32,
            g.cols as i32,
            self.partition.rows as i32,
            g.window_hh as i32,
            g.window_hw as i32,
            g.border_x as i32,
            g.border_y as i32,
            self.plane_b() as i32,
            self.results() as i32,
        ]
    }
}

/// Writes the header and the partition's slice of both planes.
///
/// `grad_x` and `grad_y` are full images in fixed point. Nothing is written
/// unless the whole payload fits.
pub fn pack(layout: &Layout, grad_x: &[i32], grad_y: &[i32], buf: &mut [u8]) -> CodecResult<()> {
    let image_len = layout.geometry.rows * layout.geometry.cols;
    for plane in [grad_x, grad_y] {
        if plane.len() != image_len {
            return Err(CodecError::PlaneSize {
                expected: image_len,
                actual: plane.len(),
            });
        }
    }
    let required = layout.bytes();
    if required > buf.len() {
        return Err(CodecError::CapacityExceeded {
            required,
            available: buf.len(),
        });
    }

    let cols = layout.geometry.cols;
    let first = (layout.partition.first_row - layout.geometry.window_hh) * cols;
    let band = first..first + layout.plane_len;

    let mut words = WordsMut::new(buf);
    words.put(0, &layout.header())?;
    words.put(PLANE_A, &grad_x[band.clone()])?;
    words.put(layout.plane_b(), &grad_y[band])?;
    words.put(layout.results(), &vec![0; layout.result_count])?;
    Ok(())
}

/// Header as read back from a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub rows: i32,
    pub cols: i32,
    pub rows_dsp: i32,
    pub window_hh: i32,
    pub window_hw: i32,
    pub border_x: i32,
    pub border_y: i32,
    pub plane_b: i32,
    pub results: i32,
}

impl Header {
    /// Checks that every plane access the header implies stays inside a
    /// buffer of `words` words, and returns the header as unsigned extents.
    pub fn extents(&self, words: usize) -> CodecResult<Extents> {
        let non_negative = |field: usize, value: i32| {
            usize::try_from(value).map_err(|_| CodecError::BadHeader { field, value })
        };
        let cols = non_negative(field::COLS, self.cols)?;
        let rows_dsp = non_negative(field::ROWS_DSP, self.rows_dsp)?;
        let window_hh = non_negative(field::WINDOW_HH, self.window_hh)?;
        let window_hw = non_negative(field::WINDOW_HW, self.window_hw)?;
        let border_x = non_negative(field::BORDER_X, self.border_x)?;
        let plane_b = non_negative(field::PLANE_B, self.plane_b)?;
        let results = non_negative(field::RESULTS, self.results)?;

        if border_x < window_hw || cols <= 2 * border_x {
            return Err(CodecError::BadHeader {
                field: field::BORDER_X,
                value: self.border_x,
            });
        }
        let plane_len = (rows_dsp + 2 * window_hh) * cols;
        if plane_b < PLANE_A + plane_len || plane_b + plane_len > words {
            return Err(CodecError::BadHeader {
                field: field::PLANE_B,
                value: self.plane_b,
            });
        }
        let result_count = rows_dsp * (cols - 2 * border_x);
        if results < plane_b + plane_len || results + result_count > words {
            return Err(CodecError::BadHeader {
                field: field::RESULTS,
                value: self.results,
            });
        }

        Ok(Extents {
            cols,
            rows_dsp,
            window_hh,
            window_hw,
            border_x,
            plane_b,
            results,
        })
    }
}

/// Header fields after validation against the buffer size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extents {
    pub cols: usize,
    pub rows_dsp: usize,
    pub window_hh: usize,
    pub window_hw: usize,
    pub border_x: usize,
    pub plane_b: usize,
    pub results: usize,
}

pub fn read_header(buf: &[u8]) -> CodecResult<Header> {
    let w = Words::new(buf).range(0, HEADER_WORDS)?;
    Ok(Header {
        rows: w[field::ROWS],
        cols: w[field::COLS],
        rows_dsp: w[field::ROWS_DSP],
        window_hh: w[field::WINDOW_HH],
        window_hw: w[field::WINDOW_HW],
        border_x: w[field::BORDER_X],
        border_y: w[field::BORDER_Y],
        plane_b: w[field::PLANE_B],
        results: w[field::RESULTS],
    })
}

/// Reads the result stream, checking that the co-processor advanced field 8
/// by exactly one word per owned pixel.
pub fn unpack_results(layout: &Layout, buf: &[u8]) -> CodecResult<Vec<i32>> {
    let words = Words::new(buf);
    let next_free = words.get(field::RESULTS)?;
    let reported = usize::try_from(next_free)
        .ok()
        .and_then(|end| end.checked_sub(layout.results()))
        .ok_or(CodecError::BadHeader {
            field: field::RESULTS,
            value: next_free,
        })?;
    if reported != layout.result_count {
        return Err(CodecError::ResultCountMismatch {
            expected: layout.result_count,
            reported,
        });
    }
    words.range(layout.results(), layout.result_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            rows: 12,
            cols: 10,
            window_hh: 1,
            window_hw: 1,
            border_x: 2,
            border_y: 2,
        }
    }

    fn ramp(len: usize, base: i32) -> Vec<i32> {
        (0..len as i32).map(|i| base + i).collect()
    }

    #[test]
    fn layout_places_planes_after_header() {
        let g = geometry();
        let layout = Layout::new(g, Partition::whole(&g)).expect("layout");
        assert_eq!(layout.partition(), &Partition { first_row: 2, rows: 8 });
        assert_eq!(layout.plane_len(), 10 * 10);
        assert_eq!(layout.plane_b(), 109);
        assert_eq!(layout.results(), 209);
        assert_eq!(layout.result_count(), 8 * 6);
        assert_eq!(layout.bytes(), (209 + 48) * 4);
    }

    #[test]
    fn pack_writes_header_and_band() {
        let g = geometry();
        let layout = Layout::new(g, Partition { first_row: 3, rows: 4 }).expect("layout");
        let gx = ramp(120, 0);
        let gy = ramp(120, 1000);
        let mut buf = vec![0xFF; layout.bytes() + 16];
        pack(&layout, &gx, &gy, &mut buf).expect("pack");

        let header = read_header(&buf).expect("header");
        assert_eq!(
            header,
            Header {
                rows: 12,
                cols: 10,
                rows_dsp: 4,
                window_hh: 1,
                window_hw: 1,
                border_x: 2,
                border_y: 2,
                plane_b: layout.plane_b() as i32,
                results: layout.results() as i32,
            }
        );

        let words = Words::new(&buf);
        // Plane row 0 is image row first_row - window_hh.
        assert_eq!(words.get(PLANE_A).expect("a0"), 20);
        assert_eq!(words.get(layout.plane_b() - 1).expect("a last"), 79);
        assert_eq!(words.get(layout.plane_b()).expect("b0"), 1020);
        assert_eq!(words.get(layout.results()).expect("r0"), 0);
        assert_eq!(buf[layout.bytes()..], [0xFF; 16]);

        let extents = header.extents(words.len()).expect("extents");
        assert_eq!(extents.plane_b, layout.plane_b());
        assert_eq!(extents.rows_dsp, 4);
    }

    #[test]
    fn capacity_guard_leaves_buffer_untouched() {
        let g = geometry();
        let layout = Layout::new(g, Partition::whole(&g)).expect("layout");
        let mut buf = vec![0x5A; layout.bytes() - 4];
        let err = pack(&layout, &ramp(120, 0), &ramp(120, 0), &mut buf).expect_err("too small");
        assert_eq!(
            err,
            CodecError::CapacityExceeded {
                required: layout.bytes(),
                available: layout.bytes() - 4,
            }
        );
        assert!(buf.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn rejects_partitions_outside_the_image() {
        let g = geometry();
        assert!(Layout::new(g, Partition { first_row: 0, rows: 4 }).is_err());
        assert!(Layout::new(g, Partition { first_row: 2, rows: 10 }).is_err());
        assert!(Layout::new(g, Partition { first_row: 2, rows: 0 }).is_err());
        let narrow = Geometry { cols: 4, ..g };
        assert!(Layout::new(narrow, Partition::whole(&narrow)).is_err());
    }

    #[test]
    fn plane_sizes_are_checked() {
        let g = geometry();
        let layout = Layout::new(g, Partition::whole(&g)).expect("layout");
        let mut buf = vec![0; layout.bytes()];
        assert_eq!(
            pack(&layout, &ramp(119, 0), &ramp(120, 0), &mut buf),
            Err(CodecError::PlaneSize {
                expected: 120,
                actual: 119
            })
        );
    }

    #[test]
    fn unpack_checks_the_result_cursor() {
        let g = geometry();
        let layout = Layout::new(g, Partition::leading(&g, 1)).expect("layout");
        let mut buf = vec![0; layout.bytes()];
        pack(&layout, &ramp(120, 0), &ramp(120, 0), &mut buf).expect("pack");

        // Kernel has not run: cursor still at the start.
        assert_eq!(
            unpack_results(&layout, &buf),
            Err(CodecError::ResultCountMismatch {
                expected: 6,
                reported: 0
            })
        );

        let mut words = WordsMut::new(&mut buf);
        words.put(layout.results(), &[1, 2, 3, 4, 5, 6]).expect("results");
        words
            .set(field::RESULTS, (layout.results() + 6) as i32)
            .expect("cursor");
        assert_eq!(unpack_results(&layout, &buf), Ok(vec![1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn corrupt_headers_are_rejected() {
        let g = geometry();
        let layout = Layout::new(g, Partition::whole(&g)).expect("layout");
        let mut buf = vec![0; layout.bytes()];
        pack(&layout, &ramp(120, 0), &ramp(120, 0), &mut buf).expect("pack");
        let words = layout.words();

        let mut header = read_header(&buf).expect("header");
        header.plane_b = -1;
        assert!(matches!(
            header.extents(words),
            Err(CodecError::BadHeader { field: field::PLANE_B, .. })
        ));

        let mut header = read_header(&buf).expect("header");
        header.rows_dsp += 1;
        assert!(header.extents(words).is_err());
    }
}
