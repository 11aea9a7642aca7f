#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0. {
        (1. + (-x).exp()).recip()
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

/// `ln(sigmoid(x))` without overflow for large `|x|`.
#[inline]
pub fn ln_sigmoid(x: f64) -> f64 {
    if x >= 0. {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1. - p)).ln()
}

#[inline]
fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

pub fn logsumexp(values: &[f64]) -> f64 {
    values
        .iter()
        .fold(f64::NEG_INFINITY, |acc, &x| logaddexp(acc, x))
}

/// Writes `log(softmax(values))` into `out`.
pub fn log_softmax(values: &[f64], out: &mut [f64]) {
    assert!(values.len() == out.len());
    let norm = logsumexp(values);
    out.iter_mut()
        .zip(values)
        .for_each(|(out, &val)| *out = val - norm);
}
