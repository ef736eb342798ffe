//! Fast lifted wavelet transform on the interval
//!
//! A 1D biorthogonal wavelet transform built with the lifting scheme. The
//! predict step computes gamma (detail) coefficients from the even samples
//! with filters obtained by Neville polynomial interpolation; the update step
//! lifts the lambda (approximation) coefficients with lifting coefficients
//! that preserve the first `ntilde` moments, found by solving the
//! moment-matching equations with an LU decomposition.
//!
//! Filters near the ends of the interval are extrapolated rather than
//! wrapped, so no periodic extension is assumed. Coefficients are computed
//! in place and left interleaved: lambdas at even indices, gammas at odd.

use crate::error::{Result, VdcError};

/// Largest supported number of filter or lifting coefficients
pub const MAX_FILTER_COEFF: usize = 32;

const TINY: f64 = 1.0e-20;
const FLT_EPSILON: f64 = 6.0e-8;

fn is_zero(x: f64) -> bool {
    -100.0 * FLT_EPSILON < x && x < 100.0 * FLT_EPSILON
}

/// Precomputed 1D lifting transform for a fixed width
#[derive(Debug, Clone)]
pub struct Lifting1D {
    n: usize,
    ntilde: usize,
    width: usize,
    fwd_filter: Vec<f64>,
    inv_filter: Vec<f64>,
    fwd_lifting: Vec<f64>,
    inv_lifting: Vec<f64>,
}

impl Lifting1D {
    /// Build a transform with `n` filter coefficients and `ntilde` lifting
    /// coefficients over `width` samples. `n == ntilde == 1` selects Haar.
    pub fn new(n: usize, ntilde: usize, width: usize) -> Result<Self> {
        Self::check_params(n, ntilde, width)?;

        let mut lifting = Self {
            n,
            ntilde,
            width,
            fwd_filter: Vec::new(),
            inv_filter: Vec::new(),
            fwd_lifting: Vec::new(),
            inv_lifting: Vec::new(),
        };
        if lifting.is_haar() {
            return Ok(lifting);
        }

        lifting.fwd_filter = create_fwd_filter(n);
        lifting.inv_filter = lifting.fwd_filter.iter().map(|f| -f).collect();
        lifting.fwd_lifting = create_fwd_lifting(&lifting.fwd_filter, n, ntilde, width)?;
        lifting.inv_lifting = lifting.fwd_lifting.iter().map(|f| -f).collect();
        Ok(lifting)
    }

    /// Validate transform parameters without building the tables
    pub fn check_params(n: usize, ntilde: usize, width: usize) -> Result<()> {
        if n == 1 && ntilde == 1 {
            return Ok(());
        }
        if n == 0 || ntilde == 0 {
            return Err(VdcError::Configuration(format!(
                "Invalid # lifting coeffs., n={}, ntilde={}",
                n, ntilde
            )));
        }
        if n % 2 != 0 {
            return Err(VdcError::Configuration(format!(
                "Invalid # lifting coeffs., n={}, is odd",
                n
            )));
        }
        if ntilde % 2 != 0 {
            return Err(VdcError::Configuration(format!(
                "Invalid # lifting coeffs., ntilde={}, is odd",
                ntilde
            )));
        }
        if n > MAX_FILTER_COEFF {
            return Err(VdcError::Configuration(format!(
                "Invalid # of lifting coeffs., n={}, exceeds max={}",
                n, MAX_FILTER_COEFF
            )));
        }
        if ntilde > MAX_FILTER_COEFF {
            return Err(VdcError::Configuration(format!(
                "Invalid # of lifting coeffs., ntilde={}, exceeds max={}",
                ntilde, MAX_FILTER_COEFF
            )));
        }

        // max vanishing moments
        let max_n = n.max(ntilde) - 1;
        let maxl = if width <= 1 {
            0
        } else {
            ((width - 1) as f64 / max_n as f64).log2().floor() as i64
        };
        if maxl < 1 {
            return Err(VdcError::Configuration(format!(
                "Invalid # of samples, width={}, less than # moments",
                width
            )));
        }
        Ok(())
    }

    pub fn is_haar(&self) -> bool {
        self.n == 1 && self.ntilde == 1
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn ntilde(&self) -> usize {
        self.ntilde
    }

    /// Forward transform `width` samples in place
    pub fn forward_transform(&self, data: &mut [f32]) -> Result<()> {
        self.check_len(data)?;
        if self.is_haar() {
            forward_haar(data);
        } else {
            predict(data, self.n, &self.fwd_filter);
            update(data, self.ntilde, &self.fwd_lifting);
        }
        Ok(())
    }

    /// Inverse transform `width` interleaved coefficients in place
    pub fn inverse_transform(&self, data: &mut [f32]) -> Result<()> {
        self.check_len(data)?;
        if self.is_haar() {
            inverse_haar(data);
        } else {
            update(data, self.ntilde, &self.inv_lifting);
            predict(data, self.n, &self.inv_filter);
        }
        Ok(())
    }

    fn check_len(&self, data: &[f32]) -> Result<()> {
        if data.len() != self.width {
            return Err(VdcError::InvalidDimensions(format!(
                "lifting width is {}, got {} samples",
                self.width,
                data.len()
            )));
        }
        Ok(())
    }
}

/// Value at `xx` of the polynomial through the points `(x, f)`
fn neville(x: &[f64], f: &[f64], xx: f64) -> f64 {
    let n = x.len();
    let mut vy = vec![0.0; n];
    for i in 0..n {
        vy[i] = f[i];
        for j in (0..i).rev() {
            let den = x[i] - x[j];
            vy[j] = vy[j + 1] + (vy[j + 1] - vy[j]) * (xx - x[i]) / den;
        }
    }
    vy[0]
}

/// Prediction filters, `n/2 + 1` rows of `n` coefficients.
///
/// Row `r` holds the case with `r` lambdas on the left and `n - r` on the
/// right. The mirrored cases reuse these rows read backwards.
fn create_fwd_filter(n: usize) -> Vec<f64> {
    let nrows = (n >> 1) + 1;
    let mut filter = vec![0.0; nrows * n];

    let mut xa = vec![0.0; n];
    xa[0] = 0.5 * (1.0 - n as f64);
    for col in 1..n {
        xa[col] = xa[col - 1] + 1.0;
    }

    let mut ya = vec![0.0; n];
    for row in 0..nrows {
        let x = row as f64;
        for col in 0..n {
            ya.iter_mut().for_each(|v| *v = 0.0);
            ya[col] = 1.0;
            filter[nrows * n - 1 - (row * n + col)] = neville(&xa, &ya, x);
        }
    }
    filter
}

/// Integral-moment table: `moment[k][i] = k^i`
fn create_moment(ntilde: usize, width: usize) -> Vec<Vec<f64>> {
    (0..width)
        .map(|row| (0..ntilde).map(|col| (row as f64).powi(col as i32)).collect())
        .collect()
}

fn add_scaled_row(moment: &mut [Vec<f64>], dst: usize, src: usize, scale: f64) {
    for j in 0..moment[dst].len() {
        let v = moment[src][j];
        moment[dst][j] += scale * v;
    }
}

fn update_moment(moment: &mut [Vec<f64>], filter: &[f64], no_gammas: usize, len: usize, n: usize) {
    let top1 = (n >> 1) as i64 - 1;
    let top3 = (n >> 1) as i64 - (len % 2) as i64;
    let top2 = no_gammas as i64 - (top1 + top3);

    let mut fp = 0usize;
    let mut idx_g = 1usize;

    // fewer lambdas on the left than on the right
    for _ in 0..top1.max(0) {
        let mut idx_l = 0usize;
        fp += n;
        for col in 0..n {
            add_scaled_row(moment, idx_l, idx_g, filter[fp + col]);
            idx_l += 2;
        }
        idx_g += 2;
    }

    // balanced
    fp += n;
    for i in 0..top2.max(0) as usize {
        let mut idx_l = i * 2;
        for col in 0..n {
            add_scaled_row(moment, idx_l, idx_g, filter[fp + col]);
            idx_l += 2;
        }
        idx_g += 2;
    }

    // more lambdas on the left than on the right
    let base = ((top2 - 1).max(0) as usize) * 2;
    for _ in 0..top3.max(0) {
        let mut idx_l = base;
        fp -= n;
        for col in (0..n).rev() {
            add_scaled_row(moment, idx_l, idx_g, filter[fp + col]);
            idx_l += 2;
        }
        idx_g += 2;
    }
}

/// LU decomposition with partial pivoting, in place. Returns the row
/// permutation.
fn lu_decompose(a: &mut [Vec<f64>]) -> Result<Vec<usize>> {
    let n = a.len();
    let mut indx = vec![0usize; n];
    let mut vv = vec![0.0; n];

    for i in 0..n {
        let big = a[i].iter().fold(0.0f64, |m, v| m.max(v.abs()));
        if big == 0.0 {
            return Err(VdcError::Configuration(
                "singular moment matrix".to_string(),
            ));
        }
        vv[i] = 1.0 / big;
    }

    for j in 0..n {
        for i in 0..j {
            let mut sum = a[i][j];
            for k in 0..i {
                sum -= a[i][k] * a[k][j];
            }
            a[i][j] = sum;
        }
        let mut big = 0.0;
        let mut imax = j;
        for i in j..n {
            let mut sum = a[i][j];
            for k in 0..j {
                sum -= a[i][k] * a[k][j];
            }
            a[i][j] = sum;
            let dum = vv[i] * sum.abs();
            if dum >= big {
                big = dum;
                imax = i;
            }
        }
        if j != imax {
            a.swap(imax, j);
            vv[imax] = vv[j];
        }
        indx[j] = imax;
        if a[j][j] == 0.0 {
            a[j][j] = TINY;
        }
        if j != n - 1 {
            let dum = 1.0 / a[j][j];
            for row in a.iter_mut().skip(j + 1) {
                row[j] *= dum;
            }
        }
    }
    Ok(indx)
}

/// Solve `A.x = b` given the LU decomposition of `A`; `b` becomes `x`
fn lu_back_substitute(a: &[Vec<f64>], indx: &[usize], b: &mut [f64]) {
    let n = a.len();
    let mut ii: Option<usize> = None;
    for i in 0..n {
        let ip = indx[i];
        let mut sum = b[ip];
        b[ip] = b[i];
        if let Some(start) = ii {
            for j in start..i {
                sum -= a[i][j] * b[j];
            }
        } else if sum != 0.0 {
            ii = Some(i);
        }
        b[i] = sum;
    }
    for i in (0..n).rev() {
        let mut sum = b[i];
        for j in (i + 1)..n {
            sum -= a[i][j] * b[j];
        }
        b[i] = sum / a[i][i];
        if is_zero(b[i]) {
            b[i] = 0.0;
        }
    }
}

fn solve_lifting(moment: &[Vec<f64>], idx_l: usize, idx_g: usize, ntilde: usize) -> Result<Vec<f64>> {
    let mut lift = vec![vec![0.0; ntilde]; ntilde];
    for col in 0..ntilde {
        for (row, lift_row) in lift.iter_mut().enumerate() {
            lift_row[col] = moment[idx_l + 2 * col][row];
        }
    }
    let indx = lu_decompose(&mut lift)?;
    let mut b: Vec<f64> = moment[idx_g][..ntilde].to_vec();
    lu_back_substitute(&lift, &indx, &mut b);
    Ok(b)
}

fn update_lifting(
    moment: &[Vec<f64>],
    len: usize,
    no_gammas: usize,
    ntilde: usize,
) -> Result<Vec<f64>> {
    let mut lifting = Vec::with_capacity(no_gammas * ntilde);

    let top1 = (ntilde >> 1) as i64 - 1;
    let top3 = (ntilde >> 1) as i64 - (len % 2) as i64;
    let top2 = no_gammas as i64 - (top1 + top3);

    let mut idx_g = 1usize;
    for _ in 0..top1.max(0) {
        lifting.extend(solve_lifting(moment, 0, idx_g, ntilde)?);
        idx_g += 2;
    }
    for i in 0..top2.max(0) as usize {
        lifting.extend(solve_lifting(moment, i * 2, idx_g, ntilde)?);
        idx_g += 2;
    }
    let base = ((top2 - 1).max(0) as usize) * 2;
    for _ in 0..top3.max(0) {
        lifting.extend(solve_lifting(moment, base, idx_g, ntilde)?);
        idx_g += 2;
    }
    Ok(lifting)
}

fn create_fwd_lifting(filter: &[f64], n: usize, ntilde: usize, width: usize) -> Result<Vec<f64>> {
    let no_gammas = width >> 1;
    if no_gammas == 0 {
        return Ok(Vec::new());
    }
    let mut moment = create_moment(ntilde, width);
    update_moment(&mut moment, filter, no_gammas, width, n);
    update_lifting(&moment, width, no_gammas, ntilde)
}

/// Replace each gamma (odd sample) by its failure to be predicted from the
/// neighbouring lambdas
fn predict(data: &mut [f32], n: usize, filter: &[f64]) {
    let len = data.len();
    let odd = len % 2;
    let mut stop1 = n >> 1;
    let stop3 = stop1 - odd;
    let stop2 = (len >> 1) + 1 + odd - n;
    stop1 -= 1;

    let mut fptr = n;
    let mut gamma = 1usize;

    for _ in 0..stop1 {
        let mut lambda = 0usize;
        let mut acc = data[gamma] as f64;
        for _ in 0..n {
            acc -= data[lambda] as f64 * filter[fptr];
            fptr += 1;
            lambda += 2;
        }
        data[gamma] = acc as f32;
        gamma += 2;
    }

    let mut soi = 0usize;
    for _ in 0..stop2 {
        let mut lambda = soi;
        let mut acc = data[gamma] as f64;
        for k in 0..n {
            acc -= data[lambda] as f64 * filter[fptr + k];
            lambda += 2;
        }
        data[gamma] = acc as f32;
        soi += 2;
        gamma += 2;
    }

    let mut fp = fptr;
    let base = soi - 2;
    for _ in 0..stop3 {
        let mut lambda = base;
        let mut acc = data[gamma] as f64;
        for _ in 0..n {
            fp -= 1;
            acc -= data[lambda] as f64 * filter[fp];
            lambda += 2;
        }
        data[gamma] = acc as f32;
        gamma += 2;
    }
}

/// Lift the lambdas (even samples) with the gammas
fn update(data: &mut [f32], ntilde: usize, lc: &[f64]) {
    let len = data.len();
    let odd = len % 2;
    let no_gammas = len >> 1;
    let mut stop1 = ntilde >> 1;
    let stop3 = stop1 - odd;
    let stop2 = no_gammas + 1 + odd - ntilde;
    stop1 -= 1;

    let mut lp = 0usize;
    let mut vg = 1usize;

    for _ in 0..stop1 {
        let mut vl = 0usize;
        let g = data[vg] as f64;
        for _ in 0..ntilde {
            data[vl] = (data[vl] as f64 + g * lc[lp]) as f32;
            lp += 1;
            vl += 2;
        }
        vg += 2;
    }

    let mut soi = 0usize;
    for _ in 0..stop2 {
        let mut vl = soi;
        let g = data[vg] as f64;
        for _ in 0..ntilde {
            data[vl] = (data[vl] as f64 + g * lc[lp]) as f32;
            lp += 1;
            vl += 2;
        }
        vg += 2;
        soi += 2;
    }

    let base = soi - 2;
    for _ in 0..stop3 {
        let mut vl = base;
        let g = data[vg] as f64;
        for _ in 0..ntilde {
            data[vl] = (data[vl] as f64 + g * lc[lp]) as f32;
            lp += 1;
            vl += 2;
        }
        vg += 2;
    }
}

fn forward_haar(data: &mut [f32]) {
    let width = data.len();
    let ng = width >> 1;
    let nl = width - ng;
    let odd = width % 2 == 1;

    // odd widths preserve the mean through the trailing lambda
    let lave = if odd {
        data.iter().map(|&v| v as f64).sum::<f64>() / width as f64
    } else {
        0.0
    };

    let mut lsum = 0.0f64;
    for i in 0..ng {
        let (l, g) = (2 * i, 2 * i + 1);
        data[g] -= data[l];
        data[l] = (data[l] as f64 + data[g] as f64 / 2.0) as f32;
        lsum += data[l] as f64;
    }
    if odd {
        data[2 * ng] = (lave * nl as f64 - lsum) as f32;
    }
}

fn inverse_haar(data: &mut [f32]) {
    let width = data.len();
    let ng = width >> 1;
    let nl = width - ng;
    let odd = width % 2 == 1;

    let lave = if odd {
        (0..nl).map(|i| data[2 * i] as f64).sum::<f64>() / nl as f64
    } else {
        0.0
    };

    let mut lsum = 0.0f64;
    for i in 0..ng {
        let (l, g) = (2 * i, 2 * i + 1);
        data[l] = (data[l] as f64 - data[g] as f64 * 0.5) as f32;
        data[g] += data[l];
        lsum += data[l] as f64 + data[g] as f64;
    }
    if odd {
        data[2 * ng] = (lave * width as f64 - lsum) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: usize) -> Vec<f32> {
        (0..width).map(|i| (i as f32 * 0.37).sin() * 10.0 + i as f32).collect()
    }

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() <= tol, "sample {}: {} vs {}", i, x, y);
        }
    }

    #[test]
    fn test_haar_even() {
        let lifting = Lifting1D::new(1, 1, 4).unwrap();
        let mut data = vec![1.0, 3.0, 5.0, 9.0];
        lifting.forward_transform(&mut data).unwrap();
        // lambdas are pair averages, gammas pair differences
        assert_eq!(data, vec![2.0, 2.0, 7.0, 4.0]);
        lifting.inverse_transform(&mut data).unwrap();
        assert_eq!(data, vec![1.0, 3.0, 5.0, 9.0]);
    }

    #[test]
    fn test_haar_odd_preserves_mean() {
        let lifting = Lifting1D::new(1, 1, 5).unwrap();
        let original = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let mut data = original.clone();
        lifting.forward_transform(&mut data).unwrap();

        let lambda_mean = (data[0] + data[2] + data[4]) / 3.0;
        assert!((lambda_mean - 3.0).abs() < 1e-6);

        lifting.inverse_transform(&mut data).unwrap();
        assert_close(&data, &original, 1e-5);
    }

    #[test]
    fn test_interpolating_round_trip() {
        for &(n, ntilde, width) in &[(2, 2, 8), (2, 2, 16), (4, 2, 16), (4, 4, 32), (2, 2, 7)] {
            let lifting = Lifting1D::new(n, ntilde, width).unwrap();
            let original = ramp(width);
            let mut data = original.clone();
            lifting.forward_transform(&mut data).unwrap();
            lifting.inverse_transform(&mut data).unwrap();
            assert_close(&data, &original, 1e-3);
        }
    }

    #[test]
    fn test_linear_data_has_no_detail() {
        // A linear predictor reproduces linear data exactly
        let lifting = Lifting1D::new(2, 2, 16).unwrap();
        let mut data: Vec<f32> = (0..16).map(|i| 2.0 * i as f32 + 1.0).collect();
        lifting.forward_transform(&mut data).unwrap();
        for g in data.iter().skip(1).step_by(2) {
            assert!(g.abs() < 1e-4, "gamma {}", g);
        }
    }

    #[test]
    fn test_invalid_params() {
        assert!(Lifting1D::new(3, 2, 16).is_err());
        assert!(Lifting1D::new(34, 2, 1024).is_err());
        assert!(Lifting1D::new(2, 34, 1024).is_err());
        // width too small for the number of moments
        assert!(Lifting1D::new(4, 4, 4).is_err());
        assert!(Lifting1D::new(2, 2, 2).is_err());
        assert!(Lifting1D::new(1, 1, 1).is_ok());
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        let lifting = Lifting1D::new(1, 1, 4).unwrap();
        let mut data = vec![0.0; 3];
        assert!(matches!(
            lifting.forward_transform(&mut data),
            Err(VdcError::InvalidDimensions(_))
        ));
    }
}
