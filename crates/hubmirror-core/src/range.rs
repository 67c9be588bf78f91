//! HTTP `Range` header parsing and resolution into absolute byte windows.

use crate::{MirrorError, MirrorErrorKind, MirrorResult};

pub const BYTES_UNIT: &str = "bytes";

/// Inclusive `(start, end)` specifier as written in the header. `None` marks an omitted side.
pub type RangeSpec = (Option<u64>, Option<u64>);

/// Absolute byte window with an exclusive end, always `start <= end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteWindow {
    pub start: u64,
    pub end: u64,
}

impl ByteWindow {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Parsed `Range` header value.
///
/// Exactly one of `ranges` (non-empty) or `suffix` is populated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeRequest {
    pub unit: String,
    pub ranges: Vec<RangeSpec>,
    pub suffix: Option<u64>,
}

impl RangeRequest {
    pub fn parse(header: &str) -> MirrorResult<Self> {
        let (unit, ranges, suffix) = parse_range_params(header)?;
        Ok(Self {
            unit,
            ranges,
            suffix,
        })
    }

    /// Request covering the whole file, used when the client sent no `Range` header.
    pub fn full(file_size: u64) -> Self {
        Self {
            unit: BYTES_UNIT.to_string(),
            ranges: vec![(Some(0), file_size.checked_sub(1))],
            suffix: None,
        }
    }

    pub fn resolve(&self, file_size: u64) -> MirrorResult<Vec<ByteWindow>> {
        get_all_ranges(file_size, &self.unit, &self.ranges, self.suffix)
    }
}

/// Split a `Range` header into `(unit, ranges, suffix)`.
pub fn parse_range_params(header: &str) -> MirrorResult<(String, Vec<RangeSpec>, Option<u64>)> {
    if header.trim().is_empty() {
        return Err(invalid("range header cannot be empty"));
    }
    let Some((unit, specs)) = header.split_once('=') else {
        return Err(invalid("invalid range header format"));
    };
    let unit = unit.trim().to_string();

    let mut ranges = Vec::new();
    let mut suffix = None;
    for spec in specs.split(',') {
        let spec = spec.trim();
        let Some((start, end)) = spec.split_once('-') else {
            return Err(invalid_spec(spec));
        };
        let (start, end) = (start.trim(), end.trim());
        match (start.is_empty(), end.is_empty()) {
            (true, true) => return Err(invalid_spec(spec)),
            (true, false) => {
                if suffix.is_some() {
                    return Err(invalid("multiple suffix range specifiers"));
                }
                suffix = Some(parse_bound(end, spec)?);
            }
            (false, true) => ranges.push((Some(parse_bound(start, spec)?), None)),
            (false, false) => ranges.push((
                Some(parse_bound(start, spec)?),
                Some(parse_bound(end, spec)?),
            )),
        }
    }

    if suffix.is_some() {
        ranges.clear();
    }
    Ok((unit, ranges, suffix))
}

/// Resolve parsed specifiers against `file_size` into clamped, exclusive-end windows.
///
/// Windows keep the order of the specifiers and are never merged. Specifiers that start at or
/// beyond the end of the file are dropped rather than reported as errors.
pub fn get_all_ranges(
    file_size: u64,
    unit: &str,
    ranges: &[RangeSpec],
    suffix: Option<u64>,
) -> MirrorResult<Vec<ByteWindow>> {
    if unit != BYTES_UNIT {
        return Err(MirrorError::with_message(
            MirrorErrorKind::InvalidInput,
            format!("unsupported range unit '{unit}'"),
        ));
    }
    if let Some(suffix) = suffix {
        return Ok(vec![ByteWindow::new(
            file_size.saturating_sub(suffix),
            file_size,
        )]);
    }

    let Some(last) = file_size.checked_sub(1) else {
        return Ok(Vec::new());
    };
    let mut windows = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(last).min(last);
        let end_exclusive = end + 1;
        if start >= end_exclusive {
            continue;
        }
        windows.push(ByteWindow::new(start, end_exclusive));
    }
    Ok(windows)
}

/// Render a `Content-Range` header value for resolved windows.
pub fn content_range_value(windows: &[ByteWindow], suffix: Option<u64>, file_size: u64) -> String {
    if let Some(suffix) = suffix {
        return format!("{BYTES_UNIT} -{suffix}/{file_size}");
    }
    if windows.is_empty() {
        return format!("{BYTES_UNIT} */{file_size}");
    }
    let spans = windows
        .iter()
        .map(|w| format!("{}-{}", w.start, w.end.saturating_sub(1)))
        .collect::<Vec<_>>()
        .join(",");
    format!("{BYTES_UNIT} {spans}/{file_size}")
}

fn parse_bound(value: &str, spec: &str) -> MirrorResult<u64> {
    value.parse::<u64>().map_err(|_| invalid_spec(spec))
}

fn invalid(message: &str) -> MirrorError {
    MirrorError::with_message(MirrorErrorKind::InvalidInput, message)
}

fn invalid_spec(spec: &str) -> MirrorError {
    MirrorError::with_message(
        MirrorErrorKind::InvalidInput,
        format!("invalid range specifier '{spec}'"),
    )
}
