use std::time::{SystemTime, UNIX_EPOCH};

use tar::{Builder, Header};

use crate::engine::error::EngineError;

/// Builds a single-file tar archive holding `code` as `filename`, ready to
/// be extracted into a sandbox workspace.
pub fn package(code: &str, filename: &str) -> Result<Vec<u8>, EngineError> {
    validate_filename(filename)?;

    let data = code.as_bytes();
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(now_secs());
    header.set_cksum();

    let mut builder = Builder::new(Vec::with_capacity(data.len() + 1024));
    builder
        .append_data(&mut header, filename, data)
        .map_err(|err| EngineError::Internal(format!("failed to archive {filename}: {err}")))?;
    builder
        .into_inner()
        .map_err(|err| EngineError::Internal(format!("failed to finish archive: {err}")))
}

fn validate_filename(filename: &str) -> Result<(), EngineError> {
    let invalid = filename.is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0')
        || filename == "."
        || filename == "..";
    if invalid {
        return Err(EngineError::Internal(format!(
            "refusing to package invalid filename {filename:?}"
        )));
    }
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use tar::Archive;

    use super::package;
    use crate::engine::error::EngineError;

    #[test]
    fn archive_holds_exactly_one_source_file() {
        let payload = package("print(input())\n", "code_1.py").expect("archive");
        let mut archive = Archive::new(payload.as_slice());
        let mut entries = archive.entries().expect("entries");

        let mut entry = entries.next().expect("one entry").expect("readable entry");
        assert_eq!(entry.path().unwrap().to_str(), Some("code_1.py"));
        assert_eq!(entry.header().mode().unwrap(), 0o644);
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "print(input())\n");
        drop(entry);

        assert!(entries.next().is_none());
    }

    #[test]
    fn empty_source_is_still_packaged() {
        let payload = package("", "Main.java").expect("archive");
        assert_eq!(payload.len() % 512, 0);
    }

    #[test]
    fn rejects_paths_that_escape_the_workspace() {
        for name in ["", "../etc/passwd", "/abs.py", "a/b.py", ".."] {
            let err = package("x", name).unwrap_err();
            assert!(matches!(err, EngineError::Internal(_)), "{name}");
        }
    }
}
