use ndarray::Array1;
use std::time::{Duration, Instant};

use crate::error::{Result, SqcError};

/// Calls `condition` every `poll_interval` until it holds or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout so the caller can pick the failure that fits,
/// e.g. `MotionTimeout` for the table. `wait` does the pausing between checks;
/// passing [`crate::control::RunControl::wait`] makes the poll abortable.
pub fn poll_until<F, W>(
    mut condition: F,
    timeout: Duration,
    poll_interval: Duration,
    mut wait: W,
) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
    W: FnMut(Duration) -> Result<()>,
{
    let start = Instant::now();
    loop {
        if condition()? {
            return Ok(true);
        }
        if start.elapsed() >= timeout {
            return Ok(false);
        }
        wait(poll_interval)?;
    }
}

/// Uncancellable wait for [`poll_until`]
pub fn sleep(duration: Duration) -> Result<()> {
    std::thread::sleep(duration);
    Ok(())
}

/// Median of a slice; the mean of the two middle values for even lengths
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Reads `n_samples` values from `read` and reduces them by median
pub fn sample_median<F>(n_samples: usize, mut read: F) -> Result<f64>
where
    F: FnMut() -> Result<f64>,
{
    if n_samples == 0 {
        return Err(SqcError::Configuration(
            "n_samples must be greater than zero".to_string(),
        ));
    }
    let mut values = Vec::with_capacity(n_samples);
    for _ in 0..n_samples {
        values.push(read()?);
    }
    median(&values).ok_or_else(|| SqcError::Instrument("no samples acquired".to_string()))
}

/// Sweep points from `begin` to `end` inclusive, spaced by `step`. The last
/// point snaps to `end` when the distance is not a multiple of the step.
pub fn linear_range(begin: f64, end: f64, step: f64) -> Vec<f64> {
    let distance = end - begin;
    if step == 0.0 || distance == 0.0 || distance.signum() != step.signum() {
        return vec![begin];
    }
    let count = (distance / step).abs();
    let whole = (count - 1e-9).ceil().max(0.0) as usize;
    let mut points = Vec::with_capacity(whole + 1);
    points.push(begin);
    for i in 1..=whole {
        if i == whole {
            points.push(end);
        } else {
            points.push(begin + i as f64 * step);
        }
    }
    points
}

/// Result of a least squares fit `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    /// Standard error of the slope
    pub std_err: f64,
}

/// Ordinary least squares regression, `None` for fewer than two points or constant x
pub fn linear_fit(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let x = Array1::from(x.to_vec());
    let y = Array1::from(y.to_vec());
    let n = x.len() as f64;
    let x_mean = x.mean()?;
    let y_mean = y.mean()?;
    let dx = &x - x_mean;
    let dy = &y - y_mean;
    let sxx = dx.dot(&dx);
    let syy = dy.dot(&dy);
    let sxy = dx.dot(&dy);
    if sxx == 0.0 {
        return None;
    }

    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;
    let r_squared = if syy == 0.0 {
        1.0
    } else {
        (sxy * sxy) / (sxx * syy)
    };
    let std_err = if x.len() > 2 {
        let residual = (syy - slope * sxy).max(0.0);
        (residual / (n - 2.0) / sxx).sqrt()
    } else {
        0.0
    };

    Some(LinearFit {
        slope,
        intercept,
        r_squared,
        std_err,
    })
}

/// Expands a strip expression like `"P1-P3, P8"` against the ordered strip names.
///
/// The result is deduplicated and kept in layout order. An empty expression
/// selects every strip.
pub fn parse_strips(names: &[String], expression: &str) -> Result<Vec<String>> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Ok(names.to_vec());
    }

    let index_of = |name: &str| {
        names.iter().position(|n| n == name).ok_or_else(|| {
            SqcError::Configuration(format!("unknown strip {name:?} in {expression:?}"))
        })
    };

    let mut selected = vec![false; names.len()];
    for token in expression.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (start, end) = match token.split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (token, token),
        };
        let start_index = index_of(start)?;
        let end_index = index_of(end)?;
        if start_index > end_index {
            return Err(SqcError::Configuration(format!(
                "invalid strip range {start}-{end}"
            )));
        }
        selected[start_index..=end_index]
            .iter_mut()
            .for_each(|s| *s = true);
    }

    Ok(names
        .iter()
        .zip(selected)
        .filter_map(|(name, keep)| keep.then(|| name.clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn names(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("P{i}")).collect()
    }

    #[test]
    fn test_poll_until_success() {
        let counter = Cell::new(0);
        let settled = poll_until(
            || {
                counter.set(counter.get() + 1);
                Ok(counter.get() >= 3)
            },
            Duration::from_millis(500),
            Duration::from_millis(1),
            sleep,
        )
        .unwrap();

        assert!(settled);
        assert_eq!(counter.get(), 3);
    }

    #[test]
    fn test_poll_until_timeout() {
        let settled = poll_until(
            || Ok(false),
            Duration::from_millis(20),
            Duration::from_millis(5),
            sleep,
        )
        .unwrap();

        assert!(!settled);
    }

    #[test]
    fn test_poll_until_condition_error_propagates() {
        let result = poll_until(
            || Err(SqcError::Instrument("table offline".to_string())),
            Duration::from_secs(10),
            Duration::from_millis(1),
            sleep,
        );

        assert!(matches!(result, Err(SqcError::Instrument(_))));
    }

    #[test]
    fn test_poll_until_abort_stops_waiting() {
        let result = poll_until(
            || Ok(false),
            Duration::from_secs(10),
            Duration::from_millis(1),
            |_| Err(SqcError::Aborted),
        );

        assert!(matches!(result, Err(SqcError::Aborted)));
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0, 100.0]), Some(3.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_sample_median_reads_n_samples() {
        let values = [5.0, 1.0, 3.0];
        let mut index = 0;
        let m = sample_median(3, || {
            let v = values[index];
            index += 1;
            Ok(v)
        })
        .unwrap();
        assert_eq!(m, 3.0);
        assert_eq!(index, 3);
        assert!(sample_median(0, || Ok(0.0)).is_err());
    }

    #[test]
    fn test_linear_range_includes_both_ends() {
        let points = linear_range(0.0, -800.0, -10.0);
        assert_eq!(points.len(), 81);
        assert_eq!(points[0], 0.0);
        assert_eq!(points[80], -800.0);

        let points = linear_range(0.0, 5.0, 2.0);
        assert_eq!(points, vec![0.0, 2.0, 4.0, 5.0]);

        assert_eq!(linear_range(1.0, 1.0, 1.0), vec![1.0]);
    }

    #[test]
    fn test_linear_fit() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, 3.0, 5.0, 7.0];
        let fit = linear_fit(&x, &y).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!((fit.r_squared - 1.0).abs() < 1e-12);
        assert!(fit.std_err < 1e-9);
        assert!(linear_fit(&[1.0, 1.0], &[0.0, 1.0]).is_none());
    }

    #[test]
    fn test_parse_strips() {
        let names = names(10);
        assert_eq!(
            parse_strips(&names, "P1-P3, P8").unwrap(),
            vec!["P1", "P2", "P3", "P8"]
        );
        assert_eq!(
            parse_strips(&names, "P8, P2-P3, P3").unwrap(),
            vec!["P2", "P3", "P8"]
        );
        assert_eq!(parse_strips(&names, "").unwrap().len(), 10);
        assert!(parse_strips(&names, "P3-P1").is_err());
        assert!(parse_strips(&names, "P42").is_err());
    }
}
