use std::io::{BufRead, BufWriter, Write};
use std::path::Path;

/// Opens a plain or gzipped file, or `stdin`, reporting a missing file as an
/// error.
pub fn open_reader(input: &str) -> anyhow::Result<Box<dyn BufRead>> {
    if input != "stdin" && !Path::new(input).is_file() {
        anyhow::bail!("could not open {}: no such file", input);
    }
    Ok(intspan::reader(input))
}

/// ```
/// use std::io::Write;
/// let dir = tempfile::tempdir().unwrap();
/// let path = dir.path().join("out.txt");
/// let mut writer = bindem::libs::io::create_writer(path.to_str().unwrap()).unwrap();
/// writer.write_all(b"chr1:1-100\n").unwrap();
/// drop(writer);
/// assert_eq!(std::fs::read_to_string(&path).unwrap(), "chr1:1-100\n");
///
/// assert!(bindem::libs::io::create_writer("/no/such/dir/out.txt").is_err());
/// ```
pub fn create_writer(output: &str) -> anyhow::Result<Box<dyn Write>> {
    let writer: Box<dyn Write> = if output == "stdout" {
        Box::new(BufWriter::new(std::io::stdout()))
    } else {
        let file = std::fs::File::create(output)
            .map_err(|e| anyhow::anyhow!("could not create {}: {}", output, e))?;
        Box::new(BufWriter::new(file))
    };

    Ok(writer)
}

/// Writes `content` to `path` in one go.
pub fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    let mut writer = create_writer(&path.to_string_lossy())?;
    writer.write_all(content.as_bytes())?;
    writer.flush()?;
    Ok(())
}
