//! Trainable parameter with an attached gradient slot

use ndarray::Array2;

/// Named 2-D parameter
///
/// Vectors (biases) are stored as `1 x n` matrices so every parameter shares
/// one shape type with the optimizers and the checkpoint format.
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    name: String,
    data: Array2<f32>,
    grad: Option<Array2<f32>>,
}

impl Param {
    /// Create a new parameter
    pub fn new(name: impl Into<String>, data: Array2<f32>) -> Self {
        Self {
            name: name.into(),
            data,
            grad: None,
        }
    }

    /// Create a zero-filled parameter
    pub fn zeros(name: impl Into<String>, rows: usize, cols: usize) -> Self {
        Self::new(name, Array2::zeros((rows, cols)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array2<f32> {
        &mut self.data
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn grad(&self) -> Option<&Array2<f32>> {
        self.grad.as_ref()
    }

    /// Accumulate gradient (for when the parameter feeds several losses)
    pub fn accumulate_grad(&mut self, grad: &Array2<f32>) {
        match self.grad.as_mut() {
            Some(existing) => *existing += grad,
            None => self.grad = Some(grad.clone()),
        }
    }

    /// Zero out gradient
    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    /// True when data and gradient hold only finite values
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
            && self
                .grad
                .as_ref()
                .is_none_or(|g| g.iter().all(|v| v.is_finite()))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_accumulate_grad() {
        let mut p = Param::new("w", array![[1.0, 2.0]]);
        assert!(p.grad().is_none());

        p.accumulate_grad(&array![[0.5, 0.5]]);
        p.accumulate_grad(&array![[1.0, -1.0]]);
        assert_eq!(p.grad().unwrap(), &array![[1.5, -0.5]]);

        p.zero_grad();
        assert!(p.grad().is_none());
    }

    #[test]
    fn test_finite_check_sees_gradient() {
        let mut p = Param::zeros("b", 1, 3);
        assert!(p.is_finite());
        p.accumulate_grad(&array![[0.0, f32::NAN, 0.0]]);
        assert!(!p.is_finite());
    }
}
