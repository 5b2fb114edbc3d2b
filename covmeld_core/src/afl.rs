use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Token in a target argument list that is substituted with the seed path.
pub const SEED_PLACEHOLDER: &str = "@@";

/// Errors raised while reading AFL-produced data files.
#[derive(Error, Debug)]
pub enum AflError {
    /// The plot_data header is missing a required column.
    #[error("plot_data header is missing the `{0}` column")]
    MissingColumn(&'static str),

    /// A data row contained a value that could not be parsed as a number.
    #[error("plot_data row {row}: cannot parse `{value}` as a number")]
    BadValue { row: usize, value: String },

    #[error("plot_data read error: {0}")]
    Csv(#[from] csv::Error),

    #[error("plot_data I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Replaces every `@@` placeholder in `args` with the given seed path.
///
/// Returns the rewritten argument list and whether a placeholder was found.
/// Callers that require file-based delivery must treat `found == false` as a
/// configuration error; callers that support stdin delivery fall back to it.
pub fn replace_placeholder(args: &[String], seed: &Path) -> (Vec<String>, bool) {
    let mut new_args = Vec::with_capacity(args.len());
    let mut found = false;

    for arg in args {
        if arg == SEED_PLACEHOLDER {
            new_args.push(seed.to_string_lossy().into_owned());
            found = true;
        } else {
            new_args.push(arg.clone());
        }
    }

    (new_args, found)
}

/// One row of an AFL `plot_data` file, reduced to the fields the aggregator
/// consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotPoint {
    pub unix_time: f64,
    /// Coverage metric. AFL reports this as a percentage string (`12.34%`);
    /// the trailing `%` is stripped on read.
    pub map_size: f64,
}

/// Reads an AFL `plot_data` file.
///
/// Tolerates the optional `# ` prefix on the header line and surrounding
/// whitespace in fields. Only `unix_time` and `map_size` are extracted.
pub fn read_plot_data<R: Read>(mut input: R) -> Result<Vec<PlotPoint>, AflError> {
    let mut content = String::new();
    input.read_to_string(&mut content)?;

    let content = content.strip_prefix("# ").unwrap_or(&content);

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers = reader.headers()?.clone();
    let col = |name: &'static str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or(AflError::MissingColumn(name))
    };
    let time_idx = col("unix_time")?;
    let map_idx = col("map_size")?;

    let mut points = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let parse = |value: &str| {
            value
                .trim_end_matches('%')
                .parse::<f64>()
                .map_err(|_| AflError::BadValue {
                    row,
                    value: value.to_string(),
                })
        };
        let unix_time = parse(record.get(time_idx).unwrap_or(""))?;
        let map_size = parse(record.get(map_idx).unwrap_or(""))?;
        points.push(PlotPoint {
            unix_time,
            map_size,
        });
    }

    Ok(points)
}
