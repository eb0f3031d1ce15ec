use crate::error::Result;
use crate::utils::mat::Scalar;
use ndarray::{Array2, Array4, ArrayViewD, ArrayViewMutD};

/// Name-keyed view over a fixed parameter struct, for code that has to treat
/// every tensor alike (an optimizer, a gradient checker).
pub trait ParamSet<A: Scalar> {
    fn entries(&self) -> Vec<(&'static str, ArrayViewD<'_, A>)>;

    fn entries_mut(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, A>)>;

    fn names(&self) -> Vec<&'static str> {
        self.entries().into_iter().map(|(name, _)| name).collect()
    }

    fn get(&self, name: &str) -> Option<ArrayViewD<'_, A>> {
        self.entries()
            .into_iter()
            .find(|(key, _)| *key == name)
            .map(|(_, view)| view)
    }

    fn get_mut(&mut self, name: &str) -> Option<ArrayViewMutD<'_, A>> {
        self.entries_mut()
            .into_iter()
            .find(|(key, _)| *key == name)
            .map(|(_, view)| view)
    }

    /// Calls `f(name, param, grad)` for every pair of matching entries.
    fn update_with<F>(&mut self, grads: &Self, mut f: F)
    where
        F: FnMut(&'static str, ArrayViewMutD<'_, A>, ArrayViewD<'_, A>),
    {
        for ((name, param), (_, grad)) in self.entries_mut().into_iter().zip(grads.entries()) {
            f(name, param, grad);
        }
    }

    fn num_params(&self) -> usize {
        self.entries().iter().map(|(_, view)| view.len()).sum()
    }
}

pub enum Evaluation<A, P> {
    Scores(Array2<A>),
    LossAndGrads { loss: A, grads: P },
}

pub trait Classifier<A: Scalar> {
    /// Gradients share the parameter type, so both always carry the same keys.
    type Params: ParamSet<A>;

    fn params(&self) -> &Self::Params;

    fn params_mut(&mut self) -> &mut Self::Params;

    /// Class scores (N, num_classes) in inference mode.
    fn predict(&mut self, x: &Array4<A>) -> Result<Array2<A>>;

    /// Data loss plus L2 penalty, and the gradient of every parameter.
    fn loss(&mut self, x: &Array4<A>, labels: &[usize]) -> Result<(A, Self::Params)>;

    fn evaluate(&mut self, x: &Array4<A>, labels: Option<&[usize]>) -> Result<Evaluation<A, Self::Params>> {
        match labels {
            None => Ok(Evaluation::Scores(self.predict(x)?)),
            Some(labels) => {
                let (loss, grads) = self.loss(x, labels)?;
                Ok(Evaluation::LossAndGrads { loss, grads })
            }
        }
    }
}
