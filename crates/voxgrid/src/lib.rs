//! voxgrid: binvox voxel grids and NumPy occupancy archives.
//!
//! - Reads and writes binvox v1 grids as produced by `binvox` and `cuda_voxelizer`.
//! - Maps world-space points onto voxels (occupancy lookup).
//! - Writes `.npy` / `.npz` arrays consumed by the training code (see [`npz`]).
//!
//! binvox layout:
//!   "#binvox 1\n"
//!   "dim <dx> <dy> <dz>\n"
//!   "translate <tx> <ty> <tz>\n"
//!   "scale <s>\n"
//!   "data\n"
//!   repeated [u8 value][u8 count]    (count <= 255, value 0 or 1)
//!
//! Voxel order: x runs slowest, then z, y runs fastest.
//! Voxel `(x, y, z)` spans `translate + [i, i + 1) * scale / max(dims)` on each axis.

pub mod npz;

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::Path;

pub use half::f16;

pub const BINVOX_MAGIC: &str = "#binvox";
pub const BINVOX_VERSION: u32 = 1;

/// Dense occupancy grid with binvox placement semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelGrid {
    /// Grid size along x, y, z.
    pub dims: [u32; 3],
    /// World position of the grid's minimum corner.
    pub translate: [f64; 3],
    /// World length covered by the largest dimension.
    pub scale: f64,
    /// Occupancy in file order (x slowest, z, y fastest).
    pub data: Vec<bool>,
}

impl VoxelGrid {
    /// An empty grid.
    pub fn new(dims: [u32; 3], translate: [f64; 3], scale: f64) -> Self {
        let len = dims.iter().map(|&d| d as usize).product();
        Self {
            dims,
            translate,
            scale,
            data: vec![false; len],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Linear index of voxel `(x, y, z)` in file order.
    #[inline(always)]
    pub fn index(&self, x: u32, y: u32, z: u32) -> usize {
        let [_, dy, dz] = self.dims;
        ((x as usize * dz as usize) + z as usize) * dy as usize + y as usize
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32, z: u32) -> bool {
        self.data[self.index(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, z: u32, occupied: bool) {
        let i = self.index(x, y, z);
        self.data[i] = occupied;
    }

    pub fn occupied_count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    /// Edge length of one voxel in world units.
    #[inline]
    pub fn voxel_size(&self) -> f64 {
        let max_dim = self.dims.iter().copied().max().unwrap_or(1).max(1);
        self.scale / max_dim as f64
    }

    /// World-space min/max corners of the whole grid.
    pub fn bounds(&self) -> ([f64; 3], [f64; 3]) {
        let size = self.voxel_size();
        let mut max = self.translate;
        for (axis, m) in max.iter_mut().enumerate() {
            *m += self.dims[axis] as f64 * size;
        }
        (self.translate, max)
    }

    /// Voxel containing a world-space point, or `None` when the point lies outside the grid.
    pub fn voxel_of(&self, p: [f64; 3]) -> Option<[u32; 3]> {
        let size = self.voxel_size();
        if !(size > 0.0) {
            return None;
        }

        let mut out = [0u32; 3];
        for axis in 0..3 {
            let t = ((p[axis] - self.translate[axis]) / size).floor();
            if !t.is_finite() || t < 0.0 || t >= self.dims[axis] as f64 {
                return None;
            }
            out[axis] = t as u32;
        }
        Some(out)
    }

    /// Occupancy at a world-space point; points outside the grid are empty.
    #[inline]
    pub fn is_occupied_at(&self, p: [f64; 3]) -> bool {
        self.voxel_of(p)
            .map(|[x, y, z]| self.get(x, y, z))
            .unwrap_or(false)
    }

    /// World-space centre of voxel `(x, y, z)`.
    pub fn voxel_center(&self, x: u32, y: u32, z: u32) -> [f64; 3] {
        let size = self.voxel_size();
        [
            self.translate[0] + (x as f64 + 0.5) * size,
            self.translate[1] + (y as f64 + 0.5) * size,
            self.translate[2] + (z as f64 + 0.5) * size,
        ]
    }
}

/// `dx * dy * dz`, or `None` when it does not fit in `usize`.
pub fn voxel_count(dims: [u32; 3]) -> Option<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg.to_owned())
}

/// Split one `\n`-terminated header line off the front of `buf`.
fn header_line<'a>(buf: &mut &'a [u8]) -> io::Result<&'a str> {
    let end = buf
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| io::Error::new(ErrorKind::UnexpectedEof, "truncated binvox header"))?;
    let (line, tail) = buf.split_at(end);
    *buf = &tail[1..];
    std::str::from_utf8(line)
        .map(|s| s.trim_end_matches('\r'))
        .map_err(|_| bad("binvox header is not ASCII"))
}

fn parse_fields<const N: usize, T: std::str::FromStr>(
    mut parts: std::str::SplitWhitespace<'_>,
    what: &str,
) -> io::Result<[T; N]>
where
    T: Copy + Default,
{
    let mut out = [T::default(); N];
    for slot in out.iter_mut() {
        *slot = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| bad(&format!("malformed binvox '{}' line", what)))?;
    }
    Ok(out)
}

/// Parse a binvox grid from a contiguous byte slice.
pub fn parse_binvox_bytes(mut p: &[u8]) -> io::Result<VoxelGrid> {
    let magic = header_line(&mut p)?;
    let version = magic
        .strip_prefix(BINVOX_MAGIC)
        .ok_or_else(|| bad("bad binvox magic"))?
        .trim();
    if version.parse::<u32>().ok() != Some(BINVOX_VERSION) {
        return Err(bad("unsupported binvox version"));
    }

    let mut dims: Option<[u32; 3]> = None;
    let mut translate = [0.0f64; 3];
    let mut scale = 1.0f64;

    loop {
        let line = header_line(&mut p)?;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("dim") => dims = Some(parse_fields::<3, u32>(parts, "dim")?),
            Some("translate") => translate = parse_fields::<3, f64>(parts, "translate")?,
            Some("scale") => scale = parse_fields::<1, f64>(parts, "scale")?[0],
            Some("data") => break,
            // Unknown header keys are tolerated.
            _ => {}
        }
    }

    let dims = dims.ok_or_else(|| bad("binvox header without 'dim'"))?;
    // Each (value, count) pair covers at most 255 voxels.
    let total = voxel_count(dims).ok_or_else(|| bad("binvox 'dim' overflows"))?;
    if total > (p.len() / 2).saturating_mul(u8::MAX as usize) {
        return Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("binvox data too short for dim {:?}", dims),
        ));
    }
    let mut grid = VoxelGrid::new(dims, translate, scale);

    let mut filled = 0usize;
    while filled < total {
        if p.len() < 2 {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated binvox data"));
        }
        let value = p[0] != 0;
        let count = p[1] as usize;
        p = &p[2..];

        let end = filled + count;
        if end > total {
            return Err(bad("binvox runs exceed grid size"));
        }
        if value {
            grid.data[filled..end].fill(true);
        }
        filled = end;
    }

    Ok(grid)
}

pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<VoxelGrid> {
    let bytes = std::fs::read(path)?;
    parse_binvox_bytes(&bytes)
}

/// Serialize a grid in binvox format.
pub fn write_binvox<W: Write>(w: &mut W, grid: &VoxelGrid) -> io::Result<()> {
    if voxel_count(grid.dims) != Some(grid.data.len()) {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "voxel data length != dims product",
        ));
    }

    let [dx, dy, dz] = grid.dims;
    let [tx, ty, tz] = grid.translate;
    writeln!(w, "{} {}", BINVOX_MAGIC, BINVOX_VERSION)?;
    writeln!(w, "dim {} {} {}", dx, dy, dz)?;
    writeln!(w, "translate {} {} {}", tx, ty, tz)?;
    writeln!(w, "scale {}", grid.scale)?;
    writeln!(w, "data")?;

    let mut i = 0usize;
    while i < grid.data.len() {
        let value = grid.data[i];
        let mut run_length = 1usize;

        while i + run_length < grid.data.len()
            && grid.data[i + run_length] == value
            && run_length < u8::MAX as usize
        {
            run_length += 1;
        }

        w.write_all(&[value as u8, run_length as u8])?;
        i += run_length;
    }

    w.flush()
}

pub fn write_file<P: AsRef<Path>>(path: P, grid: &VoxelGrid) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    write_binvox(&mut file, grid)
}

/// Pack booleans into bytes, first element in the most significant bit (NumPy `packbits`).
pub fn packbits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &b)| acc | ((b as u8) << (7 - i)))
        })
        .collect()
}

/// Inverse of [`packbits`]; `count` trims the zero padding of the last byte.
pub fn unpackbits(bytes: &[u8], count: usize) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|&byte| (0..8).map(move |i| (byte >> (7 - i)) & 1 == 1))
        .take(count)
        .collect()
}
