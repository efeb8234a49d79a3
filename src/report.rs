//! Result reporting: screen, CSV and JSON printers.
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde_json::{Map, Value};

use crate::device::DeviceInfo;
use crate::tuner::TunerResult;

pub const TAG_RESULT: &str = "[ RESULT  ]";
pub const TAG_BEST: &str = "[   BEST  ]";
pub const TAG_WARNING: &str = "[ WARNING ]";
pub const TAG_FAILED: &str = "[  FAILED ]";

/// A result counts for reporting when it verified and actually ran.
fn reportable(result: &TunerResult) -> bool {
    result.valid && result.elapsed_ms.is_finite()
}

/// The fastest valid entry of the log, if any.
pub fn best(results: &[TunerResult]) -> Option<&TunerResult> {
    results
        .iter()
        .filter(|result| reportable(result))
        .min_by(|a, b| {
            a.elapsed_ms
                .partial_cmp(&b.elapsed_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Writes one result line: a tag, the kernel name, the runtime and every
/// setting of the configuration.
pub fn print_result(out: &mut dyn Write, result: &TunerResult, tag: &str) -> io::Result<()> {
    write!(
        out,
        "{} {}; {:8.1} ms;",
        tag, result.kernel_name, result.elapsed_ms
    )?;
    for setting in &result.configuration {
        write!(out, " {};", setting)?;
    }
    writeln!(out)
}

/// Prints every valid result and the best one; returns the best runtime in
/// milliseconds, or zero when nothing succeeded.
pub fn print_to_screen(out: &mut dyn Write, results: &[TunerResult]) -> io::Result<f64> {
    let best = match best(results) {
        Some(best) => best,
        None => {
            writeln!(out, "no valid tuner results found")?;
            return Ok(0.0);
        }
    };
    for result in results.iter().filter(|result| reportable(result)) {
        print_result(out, result, TAG_RESULT)?;
    }
    print_result(out, best, TAG_BEST)?;
    Ok(best.elapsed_ms)
}

/// Prints the best configuration as a database entry keyed by device name.
pub fn print_formatted(
    out: &mut dyn Write,
    device_name: &str,
    results: &[TunerResult],
) -> io::Result<()> {
    let best = match best(results) {
        Some(best) => best,
        None => return Ok(()),
    };
    write!(out, "{{ \"{}\", {{ ", device_name)?;
    for (count, setting) in best.configuration.iter().enumerate() {
        if count > 0 {
            write!(out, ", ")?;
        }
        write!(out, "{{\"{}\",{}}}", setting.name, setting.value)?;
    }
    writeln!(out, " }} }}")
}

/// Writes all valid results to `path` as a JSON database, with free-form
/// description entries and the device identification up front.
pub fn write_json<P: AsRef<Path>>(
    path: P,
    descriptions: &[(String, String)],
    device: &DeviceInfo,
    results: &[TunerResult],
) -> Result<(), crate::Error> {
    let mut root = Map::new();
    for (key, value) in descriptions {
        root.insert(key.clone(), Value::String(value.clone()));
    }
    root.insert("device".to_string(), Value::String(device.name.clone()));
    root.insert(
        "device_vendor".to_string(),
        Value::String(device.vendor.clone()),
    );
    root.insert(
        "device_type".to_string(),
        Value::String(device.device_type.clone()),
    );
    root.insert(
        "device_core_clock".to_string(),
        Value::String(device.core_clock_mhz.to_string()),
    );
    root.insert(
        "device_compute_units".to_string(),
        Value::String(device.compute_units.to_string()),
    );
    let entries: Vec<Value> = results
        .iter()
        .filter(|result| reportable(result))
        .map(|result| {
            let mut parameters = Map::new();
            for setting in &result.configuration {
                parameters.insert(setting.name.clone(), Value::from(setting.value));
            }
            let mut entry = Map::new();
            entry.insert(
                "kernel".to_string(),
                Value::String(result.kernel_name.clone()),
            );
            entry.insert("time".to_string(), Value::from(result.elapsed_ms));
            entry.insert("parameters".to_string(), Value::Object(parameters));
            Value::Object(entry)
        })
        .collect();
    root.insert("results".to_string(), Value::Array(entries));
    let file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(file, &Value::Object(root))?;
    Ok(())
}

/// Writes all valid results to `path` as semicolon-separated values. A header
/// line is emitted whenever a new kernel name is encountered.
pub fn write_csv<P: AsRef<Path>>(path: P, results: &[TunerResult]) -> Result<(), crate::Error> {
    let mut file = BufWriter::new(File::create(path)?);
    let mut processed_kernels: Vec<&str> = Vec::new();
    for result in results.iter().filter(|result| reportable(result)) {
        if !processed_kernels.contains(&result.kernel_name.as_str()) {
            processed_kernels.push(&result.kernel_name);
            write!(file, "name;time;threads;")?;
            for setting in &result.configuration {
                write!(file, "{};", setting.name)?;
            }
            writeln!(file)?;
        }
        write!(
            file,
            "{};{:.2};{};",
            result.kernel_name, result.elapsed_ms, result.local_threads
        )?;
        for setting in &result.configuration {
            write!(file, "{};", setting.value)?;
        }
        writeln!(file)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Setting;

    fn result(name: &str, time: f64, valid: bool) -> TunerResult {
        TunerResult {
            kernel_name: name.to_string(),
            elapsed_ms: time,
            local_threads: 32,
            valid,
            configuration: vec![Setting::new("WG", 64)],
        }
    }

    #[test]
    fn best_skips_failed_and_invalid_entries() {
        let results = vec![
            result("k", std::f64::INFINITY, false),
            result("k", 0.5, false),
            result("k", 2.0, true),
            result("k", 1.0, true),
        ];
        let best = best(&results).unwrap();
        assert_eq!(best.elapsed_ms, 1.0);
    }

    #[test]
    fn screen_output_marks_the_best_entry() {
        let results = vec![result("k", 2.0, true), result("k", 1.0, true)];
        let mut out = Vec::new();
        let best_time = print_to_screen(&mut out, &results).unwrap();
        assert_eq!(best_time, 1.0);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches(TAG_RESULT).count(), 2);
        assert_eq!(text.matches(TAG_BEST).count(), 1);
        assert!(text.contains("WG 64"));
    }

    #[test]
    fn empty_logs_report_nothing() {
        let mut out = Vec::new();
        assert_eq!(print_to_screen(&mut out, &[]).unwrap(), 0.0);
    }
}
