//! NumPy `.npy` (format 1.0) and `.npz` writers.
//!
//! `.npy` layout:
//!   00 : [u8;6] magic = b"\x93NUMPY"
//!   06 : u8     major = 1, u8 minor = 0
//!   08 : u16    header_len (little-endian)
//!   0A : ASCII dict `{'descr': .., 'fortran_order': False, 'shape': (..), }`
//!        padded with spaces and a final '\n' so the data starts on a 64-byte boundary
//!   .. : raw little-endian array data, C order
//!
//! `.npz` is a zip archive holding one `<name>.npy` entry per array.

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Seek, Write};
use std::path::Path;

use half::f16;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

pub const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";
const NPY_ALIGN: usize = 64;

/// Element types that can be stored in an `.npy` array.
pub trait NpyElement: bytemuck::Pod {
    /// NumPy dtype descriptor.
    const DESCR: &'static str;
}

impl NpyElement for u8 {
    const DESCR: &'static str = "|u1";
}

impl NpyElement for f16 {
    const DESCR: &'static str = "<f2";
}

impl NpyElement for f32 {
    const DESCR: &'static str = "<f4";
}

impl NpyElement for f64 {
    const DESCR: &'static str = "<f8";
}

/// Build the magic, version and padded header dict of an `.npy` file.
pub fn npy_header(descr: &str, shape: &[usize]) -> io::Result<Vec<u8>> {
    let shape_str = match shape {
        [] => "()".to_owned(),
        [n] => format!("({},)", n),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };

    let mut dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr, shape_str
    );

    // magic(6) + version(2) + header_len(2) + dict + '\n'
    let unpadded = NPY_MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (NPY_ALIGN - unpadded % NPY_ALIGN) % NPY_ALIGN;
    dict.extend(std::iter::repeat(' ').take(padding));
    dict.push('\n');

    let header_len = u16::try_from(dict.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "npy header too long"))?;

    let mut out = Vec::with_capacity(10 + dict.len());
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    Ok(out)
}

fn element_bytes<T: NpyElement>(data: &[T]) -> std::borrow::Cow<'_, [u8]> {
    #[cfg(target_endian = "little")]
    {
        std::borrow::Cow::Borrowed(bytemuck::cast_slice(data))
    }

    #[cfg(not(target_endian = "little"))]
    {
        // Byte-swap every element into little-endian order.
        let size = std::mem::size_of::<T>();
        let mut out = bytemuck::cast_slice::<T, u8>(data).to_vec();
        for chunk in out.chunks_exact_mut(size) {
            chunk.reverse();
        }
        std::borrow::Cow::Owned(out)
    }
}

/// Write one array as a complete `.npy` stream.
pub fn write_npy<W: Write, T: NpyElement>(w: &mut W, shape: &[usize], data: &[T]) -> io::Result<()> {
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("npy shape {:?} does not match {} elements", shape, data.len()),
        ));
    }

    w.write_all(&npy_header(T::DESCR, shape)?)?;
    w.write_all(&element_bytes(data))?;
    Ok(())
}

/// Incremental `.npz` writer (deflate-compressed, as `numpy.savez_compressed`).
pub struct NpzWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
}

impl NpzWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Seek> NpzWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            zip: ZipWriter::new(inner),
        }
    }

    /// Append array `name` (stored as `<name>.npy`).
    pub fn add_array<T: NpyElement>(&mut self, name: &str, shape: &[usize], data: &[T]) -> io::Result<()> {
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(data.len() * std::mem::size_of::<T>() > u32::MAX as usize);
        self.zip.start_file(format!("{}.npy", name), options)?;
        write_npy(&mut self.zip, shape, data)
    }

    pub fn finish(mut self) -> io::Result<W> {
        Ok(self.zip.finish()?)
    }
}

/// Occupancy archive: `points` (N×3 float16, relative to `loc`), bit-packed `occupancies`
/// (uint8), and the placement of the sampling cube: `loc` (its centre, float64 so projected
/// coordinates keep sub-millimetre precision) and `scale` (its side, float32).
pub fn write_occupancy_npz<P: AsRef<Path>>(
    path: P,
    points: &[[f16; 3]],
    occupancies_packed: &[u8],
    loc: [f64; 3],
    scale: f32,
) -> io::Result<()> {
    let mut npz = NpzWriter::create(path)?;
    npz.add_array("points", &[points.len(), 3], bytemuck::cast_slice::<[f16; 3], f16>(points))?;
    npz.add_array("occupancies", &[occupancies_packed.len()], occupancies_packed)?;
    npz.add_array("loc", &[3], &loc)?;
    npz.add_array("scale", &[], &[scale])?;
    npz.finish()?.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    #[test]
    fn header_is_aligned_and_numpy_shaped() {
        let header = npy_header("<f2", &[5, 3]).unwrap();
        assert_eq!(header.len() % NPY_ALIGN, 0);
        assert_eq!(&header[..6], NPY_MAGIC);
        assert_eq!(header[6..8], [1, 0]);
        assert_eq!(*header.last().unwrap(), b'\n');

        let header_len = u16::from_le_bytes([header[8], header[9]]) as usize;
        assert_eq!(header_len + 10, header.len());

        let dict = std::str::from_utf8(&header[10..]).unwrap();
        assert!(dict.starts_with("{'descr': '<f2', 'fortran_order': False, 'shape': (5, 3), }"));

        let one_d = npy_header("|u1", &[7]).unwrap();
        assert!(std::str::from_utf8(&one_d[10..]).unwrap().contains("'shape': (7,)"));
    }

    #[test]
    fn write_npy_rejects_shape_mismatch() {
        let mut buf = Vec::new();
        let err = write_npy(&mut buf, &[2, 3], &[0u8; 5]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn npz_contains_named_arrays() {
        let points = [
            [f16::from_f32(0.5), f16::from_f32(-0.25), f16::from_f32(1.0)],
            [f16::from_f32(0.0), f16::from_f32(2.0), f16::from_f32(-1.5)],
        ];
        let occ = [0b1000_0000u8];

        let mut npz = NpzWriter::new(Cursor::new(Vec::new()));
        npz.add_array("points", &[2, 3], bytemuck::cast_slice::<[f16; 3], f16>(&points))
            .unwrap();
        npz.add_array("occupancies", &[1], &occ).unwrap();
        let bytes = npz.finish().unwrap().into_inner();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<_> = archive.file_names().map(str::to_owned).collect();
        names.sort();
        assert_eq!(names, ["occupancies.npy", "points.npy"]);

        let mut entry = archive.by_name("points.npy").unwrap();
        assert_eq!(entry.compression(), CompressionMethod::Deflated);
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw).unwrap();

        let data = &raw[raw.len() - 12..];
        assert_eq!(&data[..2], &f16::from_f32(0.5).to_le_bytes());
        assert_eq!(&data[10..], &f16::from_f32(-1.5).to_le_bytes());
        assert_eq!((raw.len() - 12) % NPY_ALIGN, 0);
    }

    #[test]
    fn occupancy_archive_layout() {
        let path = std::env::temp_dir().join(format!("voxgrid-occ-{}.npz", std::process::id()));
        let points = [[f16::from_f32(0.25); 3]; 3];
        write_occupancy_npz(&path, &points, &[0b1010_0000], [390_000.0, 5_820_000.0, 35.0], 12.5)
            .unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let mut names: Vec<_> = archive.file_names().map(str::to_owned).collect();
        names.sort();
        assert_eq!(names, ["loc.npy", "occupancies.npy", "points.npy", "scale.npy"]);

        let mut raw = Vec::new();
        archive.by_name("scale.npy").unwrap().read_to_end(&mut raw).unwrap();
        assert!(std::str::from_utf8(&raw[10..raw.len() - 4]).unwrap().contains("'shape': ()"));
        assert_eq!(&raw[raw.len() - 4..], &12.5f32.to_le_bytes());

        let mut raw = Vec::new();
        archive.by_name("loc.npy").unwrap().read_to_end(&mut raw).unwrap();
        assert!(std::str::from_utf8(&raw[10..raw.len() - 24]).unwrap().contains("'<f8'"));
        assert_eq!(&raw[raw.len() - 16..raw.len() - 8], &5_820_000.0f64.to_le_bytes());

        std::fs::remove_file(&path).unwrap();
    }
}
