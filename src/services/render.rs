use std::fs;
use std::path::PathBuf;
use std::process::Command;

use tempfile::TempDir;

use super::ServiceError;

pub const DEFAULT_RENDER_DPI: u32 = 200;

/// Page images rendered from a document. The images live as long as this value.
pub struct RenderedPages {
    _scratch: TempDir,
    pub images: Vec<PathBuf>,
}

/// Renders the document (or an inclusive 1-based page range of it) to PNG with pdftoppm.
pub fn render_pages(
    document: &[u8],
    pages: Option<(u32, u32)>,
    dpi: u32,
) -> Result<RenderedPages, ServiceError> {
    let scratch = tempfile::Builder::new().prefix("gradescan_render_").tempdir()?;
    let pdf_path = scratch.path().join("source.pdf");
    fs::write(&pdf_path, document)?;
    let output_prefix = scratch.path().join("page");

    let mut command = Command::new("pdftoppm");
    command.arg("-png").arg("-r").arg(dpi.to_string());
    if let Some((first, last)) = pages {
        command
            .arg("-f")
            .arg(first.to_string())
            .arg("-l")
            .arg(last.to_string());
    }
    let output = command
        .arg(&pdf_path)
        .arg(&output_prefix)
        .output()
        .map_err(|err| ServiceError::Command {
            program: "pdftoppm".to_string(),
            detail: err.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ServiceError::Command {
            program: "pdftoppm".to_string(),
            detail: format!("non-zero exit status: {}", stderr.trim()),
        });
    }

    let mut images = fs::read_dir(scratch.path())?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().and_then(|value| value.to_str()) == Some("png"))
        .collect::<Vec<PathBuf>>();
    images.sort();

    if images.is_empty() {
        return Err(ServiceError::Command {
            program: "pdftoppm".to_string(),
            detail: "no page images produced".to_string(),
        });
    }

    Ok(RenderedPages {
        _scratch: scratch,
        images,
    })
}
