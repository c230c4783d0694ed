//! Tabular text output for w(θ) results and covariance matrices.
//!
//! One row per bin, whitespace separated, six significant digits. The row
//! shape depends on how the bin was measured:
//!
//! - regionated:        `theta  mean_w  jackknife_error`
//! - pair bin, plain:   `theta  w  GG  GR  RG  RR`
//! - pixel bin, plain:  `theta  w  pixel_num  pixel_den`
//!
//! Covariance files carry one `theta_a theta_b cov` triple per line in
//! row-major order.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::bins::Binning;
use crate::correlation::CorrelationEngine;

/// Format with six significant digits, trimming trailing zeros.
fn sig6(x: f64) -> String {
    if !x.is_finite() {
        return format!("{x}");
    }
    if x == 0.0 {
        return "0".into();
    }
    let exponent = x.abs().log10().floor() as i32;
    if !(-4..6).contains(&exponent) {
        format!("{:.5e}", x)
    } else {
        let decimals = (5 - exponent).max(0) as usize;
        let fixed = format!("{:.*}", decimals, x);
        if fixed.contains('.') {
            fixed.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            fixed
        }
    }
}

/// Write the w(θ) table for every bin.
pub fn write_wtheta<W: Write>(binning: &Binning, writer: &mut W) -> io::Result<()> {
    for bin in binning.bins() {
        if bin.n_region() > 0 {
            writeln!(
                writer,
                "{} {} {}",
                sig6(bin.theta()),
                sig6(bin.mean_wtheta()),
                sig6(bin.mean_wtheta_error())
            )?;
        } else if bin.resolution() == 0 {
            writeln!(
                writer,
                "{} {} {} {} {} {}",
                sig6(bin.theta()),
                sig6(bin.wtheta()),
                sig6(bin.gal_gal()),
                sig6(bin.gal_rand()),
                sig6(bin.rand_gal()),
                sig6(bin.rand_rand())
            )?;
        } else {
            writeln!(
                writer,
                "{} {} {} {}",
                sig6(bin.theta()),
                sig6(bin.wtheta()),
                sig6(bin.pixel_wtheta()),
                sig6(bin.pixel_weight())
            )?;
        }
    }
    Ok(())
}

/// Write the w(θ) table to a file. Returns false on any I/O failure.
pub fn write_wtheta_file(binning: &Binning, path: &Path) -> bool {
    let Ok(file) = File::create(path) else {
        return false;
    };
    let mut writer = BufWriter::new(file);
    write_wtheta(binning, &mut writer).is_ok() && writer.flush().is_ok()
}

/// Write the covariance matrix as row-major `theta_a theta_b cov` triples.
pub fn write_covariance<W: Write>(engine: &CorrelationEngine, writer: &mut W) -> io::Result<()> {
    let bins = engine.binning().bins();
    let cov = engine.covariance();
    for a in 0..bins.len() {
        for b in 0..bins.len() {
            writeln!(
                writer,
                "{} {} {}",
                sig6(bins[a].theta()),
                sig6(bins[b].theta()),
                sig6(cov[[a, b]])
            )?;
        }
    }
    Ok(())
}

/// Write the covariance matrix to a file. Returns false on any I/O failure.
pub fn write_covariance_file(engine: &CorrelationEngine, path: &Path) -> bool {
    let Ok(file) = File::create(path) else {
        return false;
    };
    let mut writer = BufWriter::new(file);
    write_covariance(engine, &mut writer).is_ok() && writer.flush().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sig6_formats() {
        assert_eq!(sig6(0.0), "0");
        assert_eq!(sig6(1.0), "1");
        assert_eq!(sig6(0.15), "0.15");
        assert_eq!(sig6(123.456), "123.456");
        assert_eq!(sig6(123456.0), "123456");
        assert_eq!(sig6(0.000123456), "0.000123456");
        assert_eq!(sig6(1234567.0), "1.23457e6");
        assert_eq!(sig6(0.0000123456), "1.23456e-5");
        assert_eq!(sig6(-12.3456789), "-12.3457");
        assert_eq!(sig6(f64::NAN), "NaN");
    }

    fn seeded_binning(with_regions: bool) -> Binning {
        let mut binning = Binning::log_spaced(0.1, 2.0, 3.0).unwrap();
        if with_regions {
            binning.initialize_regions(4);
        }
        let split = binning.n_bins() / 2;
        for (i, bin) in binning.bins_mut().iter_mut().enumerate() {
            if i < split {
                bin.set_resolution(0);
                bin.add_to_weight(100.0 + i as f64, Some(0), Some(1));
                bin.move_weight_to_gal_gal();
                bin.add_to_weight(90.0, Some(1), Some(2));
                bin.move_weight_to_gal_rand(true);
                bin.add_to_weight(95.0, Some(2), Some(3));
                bin.move_weight_to_rand_rand();
            } else {
                bin.set_resolution(64);
                bin.add_to_pixel_wtheta(0.25, 50.0, Some(0), Some(0));
            }
        }
        binning
    }

    #[test]
    fn pair_and_pixel_rows_have_their_column_counts() {
        let binning = seeded_binning(false);
        let mut out = Vec::new();
        write_wtheta(&binning, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), binning.n_bins());
        for (i, line) in lines.iter().enumerate() {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if binning.bins()[i].resolution() == 0 {
                assert_eq!(cols.len(), 6, "pair row: {line}");
            } else {
                assert_eq!(cols.len(), 4, "pixel row: {line}");
            }
            // Every column parses back to a float.
            for col in cols {
                col.parse::<f64>().unwrap();
            }
        }
    }

    #[test]
    fn region_rows_use_the_jackknife_columns() {
        let binning = seeded_binning(true);
        let mut out = Vec::new();
        write_wtheta(&binning, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        for line in text.lines() {
            assert_eq!(line.split_whitespace().count(), 3, "region row: {line}");
        }
    }

    #[test]
    fn covariance_emits_a_full_triple_list() {
        let engine = CorrelationEngine::new(seeded_binning(true));
        let mut out = Vec::new();
        write_covariance(&engine, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        let n = engine.binning().n_bins();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), n * n);
        for line in lines {
            assert_eq!(line.split_whitespace().count(), 3);
        }
    }

    #[test]
    fn file_writers_report_success() {
        let binning = seeded_binning(false);
        let path = std::env::temp_dir().join("aspect_wtheta_test.dat");
        assert!(write_wtheta_file(&binning, &path));
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), binning.n_bins());
        let _ = std::fs::remove_file(&path);

        let bad = Path::new("/nonexistent-dir/aspect.dat");
        assert!(!write_wtheta_file(&binning, bad));
    }
}
