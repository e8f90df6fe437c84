use super::ExportSink;
use crate::error::FlowError;
use crate::pipeline::projector::ExportTable;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Write `table` (header first) as CSV
pub fn write_csv<W: Write>(writer: W, table: &ExportTable) -> Result<(), FlowError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);

    for record in table.records() {
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes exports as CSV files under one directory
#[derive(Debug, Clone)]
pub struct CsvExportSink {
    dir: PathBuf,
}

impl CsvExportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ExportSink for CsvExportSink {
    fn export(&self, filename: &str, table: &ExportTable) -> Result<PathBuf, FlowError> {
        if Path::new(filename).file_name() != Some(OsStr::new(filename)) {
            return Err(FlowError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("export name '{}' is not a plain file name", filename),
            )));
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(filename);

        let file = File::create(&path)?;
        write_csv(file, table)?;

        log::info!("💾 Exported {} rows to {}", table.len(), path.display());
        Ok(path)
    }
}
