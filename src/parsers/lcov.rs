/// Parser for the LCOV `.info` format.
///
/// Key records:
///   SF:<path to source file>
///   FN:<line>[,<end line>],<function name>
///   FNDA:<execution count>,<function name>
///   DA:<line number>,<execution count>[,<checksum>]
///   BRDA:<line>,<block>,<branch>,<taken>   ("-" means 0)
///   end_of_record
///
/// Summary records (LF, LH, FNF, FNH, BRF, BRH) are derived from the data
/// and ignored.
use std::collections::HashMap;
use std::io::BufRead;

use tracing::debug;

use super::{BranchCoverage, CoverageData, FileCoverage, FunctionCoverage, LineCoverage, Parser};
use crate::error::{CovstoreError, Result};

/// LCOV format parser.
pub struct LcovParser;

impl Parser for LcovParser {
    fn parse(&self, input: &[u8]) -> Result<CoverageData> {
        let mut data = CoverageData::new();
        parse_streaming(&mut &*input, &mut |file| {
            data.files.push(file);
            Ok(())
        })?;
        Ok(data)
    }
}

/// Streaming LCOV parser that calls `emit` once per record. Reads
/// line-by-line so the full input need not be in memory at once.
pub fn parse_streaming(
    reader: &mut dyn BufRead,
    emit: &mut dyn FnMut(FileCoverage) -> Result<()>,
) -> Result<()> {
    let mut current_file: Option<FileCoverage> = None;

    // Branch arm counter per line within the current file.
    let mut branch_indices: HashMap<u32, u32> = HashMap::new();

    // name -> (start_line, end_line)
    let mut fn_defs: HashMap<String, (u32, Option<u32>)> = HashMap::new();

    let mut raw_line = String::new();
    let mut line_no = 0usize;
    loop {
        raw_line.clear();
        let n = reader.read_line(&mut raw_line).map_err(|e| {
            CovstoreError::Parse(format!("LCOV line {}: {e}", line_no + 1))
        })?;
        if n == 0 {
            break;
        }
        line_no += 1;

        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "end_of_record" {
            if let Some(file) = current_file.take() {
                emit(file)?;
            }
            branch_indices.clear();
            fn_defs.clear();
            continue;
        }

        let Some((tag, value)) = line.split_once(':') else {
            debug!(line = line_no, "Skipping unrecognized LCOV line");
            continue;
        };

        match tag {
            "SF" => {
                if let Some(file) = current_file.take() {
                    emit(file)?;
                }
                current_file = Some(FileCoverage::new(value.to_string()));
                branch_indices.clear();
                fn_defs.clear();
            }
            "FN" => {
                if let Some((start, end, name)) = parse_fn(value) {
                    fn_defs.insert(name.to_string(), (start, end));
                }
            }
            "FNDA" => {
                if let (Some(file), Some((count, name))) = (current_file.as_mut(), value.split_once(',')) {
                    let hit_count = count.parse::<u64>().unwrap_or(0);
                    let (start_line, end_line) = match fn_defs.get(name) {
                        Some((start, end)) => (Some(*start), *end),
                        None => (None, None),
                    };
                    file.functions.push(FunctionCoverage {
                        name: name.to_string(),
                        start_line,
                        end_line,
                        hit_count,
                    });
                }
            }
            "DA" => {
                // Negative counts mark lines that are not instrumentable.
                let Some(file) = current_file.as_mut() else { continue };
                let mut parts = value.splitn(3, ',');
                let (Some(ln), Some(count)) = (parts.next(), parts.next()) else { continue };
                match (ln.parse::<u32>(), count.parse::<i64>()) {
                    (Ok(line_number), Ok(count)) if line_number > 0 && count >= 0 => {
                        file.lines.push(LineCoverage {
                            line_number,
                            hit_count: count as u64,
                        });
                    }
                    _ => debug!(line = line_no, value, "Skipping DA record"),
                }
            }
            "BRDA" => {
                let Some(file) = current_file.as_mut() else { continue };
                let parts: Vec<&str> = value.splitn(4, ',').collect();
                if parts.len() != 4 {
                    continue;
                }
                let Ok(line_number) = parts[0].parse::<u32>() else { continue };
                let hit_count = if parts[3] == "-" {
                    0
                } else {
                    parts[3].parse::<u64>().unwrap_or(0)
                };
                let idx = branch_indices.entry(line_number).or_insert(0);
                file.branches.push(BranchCoverage {
                    line_number,
                    branch_index: *idx,
                    hit_count,
                });
                *idx += 1;
            }
            _ => {}
        }
    }

    // Input that ends without end_of_record.
    if let Some(file) = current_file.take() {
        emit(file)?;
    }

    Ok(())
}

/// `<start>,<name>` or `<start>,<end>,<name>`. Function names may contain
/// commas, so the end line is only taken when it parses as a number.
fn parse_fn(value: &str) -> Option<(u32, Option<u32>, &str)> {
    let (start, rest) = value.split_once(',')?;
    let start = start.parse().ok()?;
    if let Some((end, name)) = rest.split_once(',') {
        if let Ok(end) = end.parse() {
            return Some((start, Some(end), name));
        }
    }
    Some((start, None, rest))
}
