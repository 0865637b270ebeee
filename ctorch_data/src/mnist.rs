//! MNIST IDX files: reading (plain or gzip) and synthesizing fixtures.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use memmap2::Mmap;

use crate::error::{DataError, Result};

const IMAGE_MAGIC: u32 = 0x0000_0803;
const LABEL_MAGIC: u32 = 0x0000_0801;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn from_train_flag(train: bool) -> Self {
        if train {
            Split::Train
        } else {
            Split::Test
        }
    }

    fn image_stem(self) -> &'static str {
        match self {
            Split::Train => "train-images-idx3-ubyte",
            Split::Test => "t10k-images-idx3-ubyte",
        }
    }

    fn label_stem(self) -> &'static str {
        match self {
            Split::Train => "train-labels-idx1-ubyte",
            Split::Test => "t10k-labels-idx1-ubyte",
        }
    }
}

/// Raw MNIST records: `len()` images of `rows x cols` bytes and one label each.
#[derive(Debug, Clone)]
pub struct Mnist {
    images: Vec<u8>,
    labels: Vec<u8>,
    rows: usize,
    cols: usize,
}

impl Mnist {
    pub fn load(root: impl AsRef<Path>, split: Split) -> Result<Self> {
        let root = root.as_ref();
        let image_path = locate(root, split.image_stem())?;
        let label_path = locate(root, split.label_stem())?;
        let (rows, cols, images) = parse_images(&image_path, &read_bytes(&image_path)?)?;
        let labels = parse_labels(&label_path, &read_bytes(&label_path)?)?;
        let mnist = Self::from_parts(images, labels, rows, cols)?;
        tracing::info!(
            root = %root.display(),
            ?split,
            samples = mnist.len(),
            "loaded MNIST split"
        );
        Ok(mnist)
    }

    pub fn from_parts(
        images: Vec<u8>,
        labels: Vec<u8>,
        rows: usize,
        cols: usize,
    ) -> Result<Self> {
        let pixels = rows.checked_mul(cols).unwrap_or(0);
        let image_count = if pixels == 0 { 0 } else { images.len() / pixels };
        if pixels == 0 || images.len() % pixels != 0 || image_count != labels.len() {
            return Err(DataError::CountMismatch {
                images: image_count,
                labels: labels.len(),
            });
        }
        Ok(Self {
            images,
            labels,
            rows,
            cols,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn image(&self, index: usize) -> &[u8] {
        let pixels = self.rows * self.cols;
        &self.images[index * pixels..(index + 1) * pixels]
    }

    pub fn label(&self, index: usize) -> u8 {
        self.labels[index]
    }
}

fn locate(root: &Path, stem: &str) -> Result<PathBuf> {
    let dirs = [root.to_path_buf(), root.join("raw"), root.join("MNIST").join("raw")];
    for dir in &dirs {
        for name in [stem.to_string(), format!("{}.gz", stem)] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(DataError::NotFound {
        root: root.to_path_buf(),
        stem: stem.to_string(),
    })
}

/// Raw file contents: mapped for plain files, inflated for `.gz`.
enum Contents {
    Mapped(Mmap),
    Inflated(Vec<u8>),
}

impl std::ops::Deref for Contents {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Contents::Mapped(map) => map,
            Contents::Inflated(bytes) => bytes,
        }
    }
}

fn read_bytes(path: &Path) -> Result<Contents> {
    let io_err = |source| DataError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    if path.extension().map(|ext| ext == "gz").unwrap_or(false) {
        let mut out = Vec::new();
        GzDecoder::new(file).read_to_end(&mut out).map_err(io_err)?;
        return Ok(Contents::Inflated(out));
    }
    // Zero-length files cannot be mapped on every platform.
    if file.metadata().map_err(io_err)?.len() == 0 {
        return Ok(Contents::Inflated(Vec::new()));
    }
    let map = unsafe { Mmap::map(&file) }.map_err(io_err)?;
    Ok(Contents::Mapped(map))
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn malformed(path: &Path, reason: impl Into<String>) -> DataError {
    DataError::Malformed {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn parse_images(path: &Path, bytes: &[u8]) -> Result<(usize, usize, Vec<u8>)> {
    let magic = read_u32(bytes, 0).ok_or_else(|| malformed(path, "truncated header"))?;
    if magic != IMAGE_MAGIC {
        return Err(malformed(path, format!("unexpected image magic {:#010x}", magic)));
    }
    let count = read_u32(bytes, 4).ok_or_else(|| malformed(path, "truncated header"))? as usize;
    let rows = read_u32(bytes, 8).ok_or_else(|| malformed(path, "truncated header"))? as usize;
    let cols = read_u32(bytes, 12).ok_or_else(|| malformed(path, "truncated header"))? as usize;
    let expected = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .ok_or_else(|| malformed(path, format!("{count}x{rows}x{cols} images overflow")))?;
    let payload = &bytes[16..];
    if payload.len() != expected {
        return Err(malformed(
            path,
            format!("expected {} pixel bytes, found {}", expected, payload.len()),
        ));
    }
    Ok((rows, cols, payload.to_vec()))
}

fn parse_labels(path: &Path, bytes: &[u8]) -> Result<Vec<u8>> {
    let magic = read_u32(bytes, 0).ok_or_else(|| malformed(path, "truncated header"))?;
    if magic != LABEL_MAGIC {
        return Err(malformed(path, format!("unexpected label magic {:#010x}", magic)));
    }
    let count = read_u32(bytes, 4).ok_or_else(|| malformed(path, "truncated header"))? as usize;
    let payload = &bytes[8..];
    if payload.len() != count {
        return Err(malformed(
            path,
            format!("expected {} labels, found {}", count, payload.len()),
        ));
    }
    Ok(payload.to_vec())
}

/// Writes a synthetic split under `root`: image `i` has every pixel set to
/// `(i * 3) % 256` and label `i % 10`.
pub fn synthesize(
    root: impl AsRef<Path>,
    split: Split,
    count: usize,
    rows: usize,
    cols: usize,
    gzip: bool,
) -> Result<()> {
    let root = root.as_ref();
    fs::create_dir_all(root).map_err(|source| DataError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut images = Vec::with_capacity(16 + count * rows * cols);
    images.extend_from_slice(&IMAGE_MAGIC.to_be_bytes());
    images.extend_from_slice(&(count as u32).to_be_bytes());
    images.extend_from_slice(&(rows as u32).to_be_bytes());
    images.extend_from_slice(&(cols as u32).to_be_bytes());
    for i in 0..count {
        images.extend(std::iter::repeat(((i * 3) % 256) as u8).take(rows * cols));
    }

    let mut labels = Vec::with_capacity(8 + count);
    labels.extend_from_slice(&LABEL_MAGIC.to_be_bytes());
    labels.extend_from_slice(&(count as u32).to_be_bytes());
    labels.extend((0..count).map(|i| (i % 10) as u8));

    write_file(root, split.image_stem(), &images, gzip)?;
    write_file(root, split.label_stem(), &labels, gzip)
}

fn write_file(root: &Path, stem: &str, bytes: &[u8], gzip: bool) -> Result<()> {
    let path = if gzip {
        root.join(format!("{}.gz", stem))
    } else {
        root.join(stem)
    };
    let io_err = |source| DataError::Io {
        path: path.clone(),
        source,
    };
    let file = File::create(&path).map_err(io_err)?;
    if gzip {
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(bytes).map_err(io_err)?;
        encoder.finish().map_err(io_err)?;
    } else {
        let mut file = file;
        file.write_all(bytes).map_err(io_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_plain_and_gzip_splits() {
        let dir = tempfile::tempdir().unwrap();
        synthesize(dir.path(), Split::Train, 12, 4, 3, false).unwrap();
        synthesize(dir.path().join("raw"), Split::Test, 5, 2, 2, true).unwrap();

        let train = Mnist::load(dir.path(), Split::Train).unwrap();
        assert_eq!(train.len(), 12);
        assert_eq!((train.rows(), train.cols()), (4, 3));
        assert_eq!(train.image(2), &[6u8; 12][..]);
        assert_eq!(train.label(11), 1);

        let test = Mnist::load(dir.path(), Split::Test).unwrap();
        assert_eq!(test.len(), 5);
        assert_eq!(test.label(4), 4);
    }

    #[test]
    fn missing_root_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Mnist::load(dir.path().join("nope"), Split::Train).unwrap_err();
        assert!(matches!(err, DataError::NotFound { .. }));
    }

    #[test]
    fn rejects_wrong_magic_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        synthesize(dir.path(), Split::Train, 3, 2, 2, false).unwrap();
        let labels = dir.path().join("train-labels-idx1-ubyte");
        let mut bytes = fs::read(&labels).unwrap();
        bytes.pop();
        fs::write(&labels, &bytes).unwrap();
        let err = Mnist::load(dir.path(), Split::Train).unwrap_err();
        assert!(matches!(err, DataError::Malformed { .. }), "{err}");

        let images = dir.path().join("train-images-idx3-ubyte");
        fs::write(&images, [0u8, 0, 8, 1]).unwrap();
        let err = Mnist::load(dir.path(), Split::Train).unwrap_err();
        assert!(err.to_string().contains("magic"), "{err}");
    }

    #[test]
    fn oversized_header_dimensions_are_malformed() {
        let mut header = IMAGE_MAGIC.to_be_bytes().to_vec();
        for _ in 0..3 {
            header.extend_from_slice(&u32::MAX.to_be_bytes());
        }
        let err = parse_images(Path::new("huge-idx3-ubyte"), &header).unwrap_err();
        assert!(matches!(err, DataError::Malformed { .. }), "{err}");
        assert!(err.to_string().contains("overflow"), "{err}");
    }

    #[test]
    fn plain_files_are_parsed_from_the_mapping() {
        let dir = tempfile::tempdir().unwrap();
        synthesize(dir.path(), Split::Test, 4, 3, 3, false).unwrap();
        let path = dir.path().join("t10k-images-idx3-ubyte");
        let contents = read_bytes(&path).unwrap();
        assert!(matches!(contents, Contents::Mapped(_)));
        let (rows, cols, images) = parse_images(&path, &contents).unwrap();
        assert_eq!((rows, cols, images.len()), (3, 3, 36));
        assert_eq!(&images[9..18], &[3u8; 9][..]);

        let empty = dir.path().join("empty");
        fs::write(&empty, b"").unwrap();
        assert!(read_bytes(&empty).unwrap().is_empty());
    }
}
