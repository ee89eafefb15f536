//! `multipart/form-data` bodies (RFC 7578).

use super::{BodyProcessor, BodyProcessorError, BodyProcessorOptions};
use crate::variables::{lossless_text, TransactionVariables, VariableName};
use memchr::memmem;
use std::io::{Read, Write};

const NAME: &str = "multipart";

/// Anomalies noticed while parsing, exported as `MULTIPART_*` flags.
#[derive(Debug, Default)]
struct Flags {
    boundary_quoted: bool,
    boundary_whitespace: bool,
    data_before: bool,
    data_after: bool,
    header_folding: bool,
    invalid_header_folding: bool,
    invalid_part: bool,
    invalid_quoting: bool,
    lf_line: bool,
    crlf_line: bool,
    missing_semicolon: bool,
    unmatched_boundary: bool,
}

impl Flags {
    fn strict_error(&self) -> bool {
        self.boundary_quoted
            || self.boundary_whitespace
            || self.data_before
            || self.data_after
            || self.header_folding
            || self.invalid_header_folding
            || self.invalid_part
            || self.invalid_quoting
            || (self.lf_line && self.crlf_line)
            || self.missing_semicolon
            || self.unmatched_boundary
    }

    fn export(&self, vars: &mut TransactionVariables) {
        let flag = |b: bool| if b { "1" } else { "0" };
        let pairs = [
            (VariableName::MultipartBoundaryQuoted, self.boundary_quoted),
            (VariableName::MultipartBoundaryWhitespace, self.boundary_whitespace),
            (VariableName::MultipartDataBefore, self.data_before),
            (VariableName::MultipartDataAfter, self.data_after),
            (VariableName::MultipartHeaderFolding, self.header_folding),
            (VariableName::MultipartInvalidHeaderFolding, self.invalid_header_folding),
            (VariableName::MultipartInvalidPart, self.invalid_part),
            (VariableName::MultipartInvalidQuoting, self.invalid_quoting),
            (VariableName::MultipartLfLine, self.lf_line),
            (VariableName::MultipartCrlfLfLines, self.lf_line && self.crlf_line),
            (VariableName::MultipartMissingSemicolon, self.missing_semicolon),
            (VariableName::MultipartUnmatchedBoundary, self.unmatched_boundary),
            (VariableName::MultipartFileLimitExceeded, false),
            (VariableName::MultipartStrictError, self.strict_error()),
        ];
        for (name, value) in pairs {
            vars.set(name, flag(value));
        }
    }
}

/// Extract the boundary parameter from a `Content-Type` value.
fn boundary(mime: &str, flags: &mut Flags) -> Option<String> {
    let (_, params) = mime.split_once(';')?;
    for param in params.split(';') {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("boundary") {
            continue;
        }
        if key.ends_with(char::is_whitespace) || value.starts_with(char::is_whitespace) {
            flags.boundary_whitespace = true;
        }
        let mut value = value.trim();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            flags.boundary_quoted = true;
            value = &value[1..value.len() - 1];
        }
        if value.is_empty() {
            return None;
        }
        return Some(value.to_string());
    }
    None
}

/// One parsed `Content-Disposition: form-data` header.
#[derive(Debug, Default)]
struct Disposition {
    name: Option<String>,
    filename: Option<String>,
}

fn parse_disposition(value: &str, flags: &mut Flags) -> Option<Disposition> {
    let value = value.trim();
    let rest = value
        .get(..9)
        .filter(|head| head.eq_ignore_ascii_case("form-data"))
        .map(|_| &value[9..])?;

    let mut disposition = Disposition::default();
    let mut rest = rest.trim_start();
    while !rest.is_empty() {
        match rest.strip_prefix(';') {
            Some(r) => rest = r.trim_start(),
            None => flags.missing_semicolon = true,
        }
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut end = None;
            let mut chars = quoted.char_indices();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, next)) = chars.next() {
                            out.push(next);
                        }
                    }
                    '"' => {
                        end = Some(i + 1);
                        break;
                    }
                    c => out.push(c),
                }
            }
            let Some(end) = end else {
                flags.invalid_quoting = true;
                return None;
            };
            value = out;
            rest = quoted[end..].trim_start();
        } else {
            if rest.starts_with('\'') {
                flags.invalid_quoting = true;
            }
            let end = rest.find(|c: char| c == ';' || c.is_whitespace()).unwrap_or(rest.len());
            value = rest[..end].to_string();
            rest = rest[end..].trim_start();
        }

        match key.as_str() {
            "name" => disposition.name = Some(value),
            "filename" | "filename*" => disposition.filename = Some(value),
            _ => {}
        }
    }
    Some(disposition)
}

/// Split a part into its header lines and content.
fn split_part<'a>(part: &'a [u8], flags: &mut Flags) -> (Vec<String>, &'a [u8]) {
    // The head keeps the line ending of its last header line.
    let (head, content) = match (memmem::find(part, b"\r\n\r\n"), memmem::find(part, b"\n\n")) {
        (Some(crlf), Some(lf)) if lf < crlf => (&part[..=lf], &part[lf + 2..]),
        (Some(crlf), _) => (&part[..crlf + 2], &part[crlf + 4..]),
        (None, Some(lf)) => (&part[..=lf], &part[lf + 2..]),
        (None, None) => {
            flags.invalid_part = true;
            return (Vec::new(), &[]);
        }
    };

    let mut headers: Vec<String> = Vec::new();
    for raw in head.split_inclusive(|&b| b == b'\n') {
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
        let line = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.len() == line.len() {
            flags.lf_line = true;
        } else {
            flags.crlf_line = true;
        }
        let line = String::from_utf8_lossy(line);
        if line.starts_with([' ', '\t']) {
            flags.header_folding = true;
            match headers.last_mut() {
                Some(last) => {
                    last.push(' ');
                    last.push_str(line.trim());
                }
                None => flags.invalid_header_folding = true,
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }
        if !line.contains(':') {
            flags.invalid_part = true;
        }
        headers.push(line.into_owned());
    }
    (headers, content)
}

/// Multipart processor. Text parts become `ARGS_POST`, file parts fill
/// the `FILES*` collections. File contents are written to the upload
/// directory when disk access is allowed.
#[derive(Debug, Default)]
pub struct MultipartProcessor;

impl MultipartProcessor {
    fn store_file(
        &self,
        content: &[u8],
        opts: &BodyProcessorOptions,
    ) -> Result<String, BodyProcessorError> {
        let err = |e: std::io::Error| BodyProcessorError::new(NAME, format!("upload write failed: {}", e));
        std::fs::create_dir_all(&opts.upload_dir).map_err(err)?;
        let mut file = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&opts.upload_dir)
            .map_err(err)?;
        file.write_all(content).map_err(err)?;
        let (_, path) = file.keep().map_err(|e| err(e.error))?;
        Ok(path.to_string_lossy().into_owned())
    }

    fn process_part(
        &self,
        part: &[u8],
        vars: &mut TransactionVariables,
        opts: &BodyProcessorOptions,
        flags: &mut Flags,
        combined: &mut usize,
    ) -> Result<(), BodyProcessorError> {
        let (headers, content) = split_part(part, flags);
        let disposition = headers.iter().find_map(|h| {
            let (key, value) = h.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case("content-disposition")
                .then_some(value)
        });
        let Some(disposition) = disposition.and_then(|d| parse_disposition(d, flags)) else {
            flags.invalid_part = true;
            return Ok(());
        };
        let Some(name) = disposition.name else {
            flags.invalid_part = true;
            return Ok(());
        };

        for header in &headers {
            vars.map_mut(VariableName::MultipartPartHeaders)
                .add(name.clone(), header.clone());
        }
        vars.map_mut(VariableName::MultipartName).add(name.clone(), name.clone());

        let text = lossless_text(content).into_owned();
        match disposition.filename {
            Some(filename) => {
                *combined += content.len();
                vars.map_mut(VariableName::Files).add(name.clone(), filename.clone());
                vars.map_mut(VariableName::FilesNames).add(name.clone(), name.clone());
                vars.map_mut(VariableName::FilesSizes)
                    .add(filename.clone(), content.len().to_string());
                vars.map_mut(VariableName::MultipartFilename)
                    .add(name.clone(), filename);
                if opts.disk_access {
                    let path = self.store_file(content, opts)?;
                    vars.map_mut(VariableName::FilesTmpnames).add(name.clone(), path);
                }
                vars.map_mut(VariableName::FilesTmpContent).add(name, text);
            }
            None => vars.map_mut(VariableName::ArgsPost).add(name, text),
        }
        Ok(())
    }

    fn parse(
        &self,
        body: &[u8],
        vars: &mut TransactionVariables,
        opts: &BodyProcessorOptions,
        flags: &mut Flags,
    ) -> Result<(), BodyProcessorError> {
        let boundary = boundary(&opts.mime, flags)
            .ok_or_else(|| BodyProcessorError::new(NAME, "missing boundary in Content-Type"))?;
        let delimiter = format!("--{}", boundary).into_bytes();
        let finder = memmem::Finder::new(&delimiter);

        let first = finder
            .find(body)
            .ok_or_else(|| BodyProcessorError::new(NAME, "boundary not found in body"))?;
        if body[..first].iter().any(|b| !b.is_ascii_whitespace()) {
            flags.data_before = true;
        }

        let mut combined = 0;
        let mut pos = first + delimiter.len();
        loop {
            let rest = &body[pos..];
            if rest.starts_with(b"--") {
                if rest[2..].iter().any(|b| !b.is_ascii_whitespace()) {
                    flags.data_after = true;
                }
                break;
            }
            let Some(eol) = memchr::memchr(b'\n', rest) else {
                return Err(BodyProcessorError::new(NAME, "final boundary missing"));
            };
            if rest[..eol].iter().any(|b| !b.is_ascii_whitespace()) {
                flags.unmatched_boundary = true;
            }
            let start = pos + eol + 1;

            let Some(next) = finder.find(&body[start..]).map(|n| start + n) else {
                flags.unmatched_boundary = true;
                return Err(BodyProcessorError::new(NAME, "final boundary missing"));
            };
            let mut end = next;
            if end > start && body[end - 1] == b'\n' {
                end -= 1;
                if end > start && body[end - 1] == b'\r' {
                    end -= 1;
                }
            } else if end > start {
                flags.unmatched_boundary = true;
            }
            self.process_part(&body[start..end], vars, opts, flags, &mut combined)?;
            pos = next + delimiter.len();
        }

        vars.set(VariableName::FilesCombinedSize, combined.to_string());
        Ok(())
    }
}

impl BodyProcessor for MultipartProcessor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn process_request(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError> {
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| BodyProcessorError::new(NAME, format!("read failed: {}", e)))?;

        let mut flags = Flags::default();
        let result = self.parse(&body, vars, opts, &mut flags);
        if result.is_err() {
            flags.invalid_part = true;
        }
        flags.export(vars);
        result
    }

    fn process_response(
        &self,
        _reader: &mut dyn Read,
        _vars: &mut TransactionVariables,
        _opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError> {
        Err(BodyProcessorError::new(NAME, "not supported for responses"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "---------------------------9051914041544843365972754266";

    fn body() -> String {
        [
            format!("--{}", BOUNDARY),
            "Content-Disposition: form-data; name=\"text\"".to_string(),
            String::new(),
            "text default".to_string(),
            format!("--{}", BOUNDARY),
            "Content-Disposition: form-data; name=\"file1\"; filename=\"a.txt\"".to_string(),
            "Content-Type: text/plain".to_string(),
            String::new(),
            "Content of a.txt.".to_string(),
            format!("--{}", BOUNDARY),
            "Content-Disposition: form-data; name=\"file2\"; filename=\"a.html\"".to_string(),
            "Content-Type: text/html".to_string(),
            String::new(),
            "<!DOCTYPE html><title>Content of a.html.</title>".to_string(),
            format!("--{}--", BOUNDARY),
            String::new(),
        ]
        .join("\r\n")
    }

    fn opts() -> BodyProcessorOptions {
        BodyProcessorOptions {
            mime: format!("multipart/form-data; boundary={}", BOUNDARY),
            ..Default::default()
        }
    }

    fn process(body: &str, opts: &BodyProcessorOptions) -> (TransactionVariables, Result<(), BodyProcessorError>) {
        let mut vars = TransactionVariables::new();
        let mut reader = body.as_bytes();
        let result = MultipartProcessor.process_request(&mut reader, &mut vars, opts);
        (vars, result)
    }

    #[test]
    fn test_fields_and_files() {
        let (vars, result) = process(&body(), &opts());
        result.unwrap();
        assert_eq!(vars.map(VariableName::ArgsPost).first("text"), Some("text default"));

        let files: Vec<&str> = vars.map(VariableName::Files).iter().map(|(_, v)| v).collect();
        assert_eq!(files, vec!["a.txt", "a.html"]);
        assert_eq!(vars.map(VariableName::FilesSizes).first("a.txt"), Some("17"));
        assert_eq!(vars.map(VariableName::FilesNames).first("file2"), Some("file2"));
        assert_eq!(
            vars.map(VariableName::MultipartPartHeaders).first("file2"),
            Some("Content-Disposition: form-data; name=\"file2\"; filename=\"a.html\"")
        );
        assert_eq!(vars.get(VariableName::FilesCombinedSize), Some("65"));
        assert_eq!(vars.get(VariableName::MultipartStrictError), Some("0"));
        assert!(vars.map(VariableName::FilesTmpnames).is_empty());
    }

    #[test]
    fn test_uploads_written_with_disk_access() {
        let dir = tempfile::tempdir().unwrap();
        let opts = BodyProcessorOptions {
            upload_dir: dir.path().to_path_buf(),
            disk_access: true,
            ..opts()
        };
        let (vars, result) = process(&body(), &opts);
        result.unwrap();
        let path = vars.map(VariableName::FilesTmpnames).first("file1").unwrap().to_string();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Content of a.txt.");
    }

    #[test]
    fn test_quoted_boundary() {
        let opts = BodyProcessorOptions {
            mime: format!("multipart/form-data; boundary=\"{}\"", BOUNDARY),
            ..Default::default()
        };
        let (vars, result) = process(&body(), &opts);
        result.unwrap();
        assert_eq!(vars.get(VariableName::MultipartBoundaryQuoted), Some("1"));
        assert_eq!(vars.get(VariableName::MultipartStrictError), Some("1"));
    }

    #[test]
    fn test_missing_final_boundary() {
        let truncated = format!("--{}\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nx", BOUNDARY);
        let (vars, result) = process(&truncated, &opts());
        assert!(result.is_err());
        assert_eq!(vars.get(VariableName::MultipartStrictError), Some("1"));
    }

    #[test]
    fn test_missing_boundary_param() {
        let opts = BodyProcessorOptions {
            mime: "multipart/form-data".to_string(),
            ..Default::default()
        };
        let (_, result) = process(&body(), &opts);
        assert!(result.unwrap_err().message.contains("boundary"));
    }

    #[test]
    fn test_disposition_parsing() {
        let mut flags = Flags::default();
        let d = parse_disposition(" form-data; name=\"a\\\"b\"; filename=x.txt", &mut flags).unwrap();
        assert_eq!(d.name.as_deref(), Some("a\"b"));
        assert_eq!(d.filename.as_deref(), Some("x.txt"));
        assert!(!flags.missing_semicolon);

        let mut flags = Flags::default();
        parse_disposition("form-data; name=a filename=b", &mut flags).unwrap();
        assert!(flags.missing_semicolon);

        assert!(parse_disposition("attachment; name=a", &mut Flags::default()).is_none());
    }
}
