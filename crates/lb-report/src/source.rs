use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use lb_io::{IoError, read_csv_path};
use lb_table::{Dataset, TableError};
use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no dataset named {name:?} in {location}")]
    UnknownDataset { name: String, location: String },
    #[error("failed to read dataset {name:?} from {}: {source}", path.display())]
    Read {
        name: String,
        path: PathBuf,
        source: IoError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Anything that can materialize a named dataset.
///
/// Errors are handed back to the caller unchanged; sources do not retry.
pub trait DatasetSource {
    fn fetch(&self, name: &str) -> Result<Dataset, SourceError>;
}

/// Datasets held in memory, keyed by their own name.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    datasets: HashMap<String, Dataset>,
}

impl InMemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, dataset: Dataset) -> Self {
        self.insert(dataset);
        self
    }

    /// Replaces any dataset already registered under the same name.
    pub fn insert(&mut self, dataset: Dataset) {
        self.datasets.insert(dataset.name().to_owned(), dataset);
    }
}

impl DatasetSource for InMemorySource {
    fn fetch(&self, name: &str) -> Result<Dataset, SourceError> {
        self.datasets
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::UnknownDataset {
                name: name.to_owned(),
                location: "memory".to_owned(),
            })
    }
}

/// CSV files under one directory.
///
/// A dataset is either `<root>/<name>.csv`, or a directory `<root>/<name>/`
/// whose `*.csv` files (one per season, in file name order) are stacked
/// under the union of their headers.
#[derive(Debug, Clone)]
pub struct CsvDirectorySource {
    root: PathBuf,
}

impl CsvDirectorySource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(name: &str, path: &Path) -> Result<Dataset, SourceError> {
        read_csv_path(name, path).map_err(|source| SourceError::Read {
            name: name.to_owned(),
            path: path.to_path_buf(),
            source,
        })
    }

    fn read_parts(&self, name: &str, dir: &Path) -> Result<Dataset, SourceError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "csv") {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(self.unknown(name));
        }
        files.sort();

        let parts = files
            .iter()
            .map(|path| Self::read(name, path))
            .collect::<Result<Vec<_>, _>>()?;
        debug!("dataset {name}: stacking {} season files", parts.len());
        Ok(Dataset::concat(name, &parts.iter().collect::<Vec<_>>())?)
    }

    fn unknown(&self, name: &str) -> SourceError {
        SourceError::UnknownDataset {
            name: name.to_owned(),
            location: self.root.display().to_string(),
        }
    }
}

impl DatasetSource for CsvDirectorySource {
    fn fetch(&self, name: &str) -> Result<Dataset, SourceError> {
        let file = self.root.join(format!("{name}.csv"));
        if file.is_file() {
            return Self::read(name, &file);
        }
        let dir = self.root.join(name);
        if dir.is_dir() {
            return self.read_parts(name, &dir);
        }
        Err(self.unknown(name))
    }
}
