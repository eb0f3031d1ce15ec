use approx::assert_abs_diff_eq;
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tiny_convnet::utils::mat::gaussian;
use tiny_convnet::{
    BatchNormConvNet, Classifier, ConvNetConfig, Evaluation, Mode, NetError, ParamSet, Precision,
    ThreeLayerConvNet,
};

fn random_batch(n: usize, (c, h, w): (usize, usize, usize), seed: u64) -> Array4<f64> {
    gaussian((n, c, h, w), 1.0, &mut StdRng::seed_from_u64(seed))
}

fn max_abs_diff(a: &ndarray::Array2<f64>, b: &ndarray::Array2<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .fold(0.0, |m, (x, y)| m.max((x - y).abs()))
}

#[test]
fn scores_have_batch_by_classes_shape() {
    for (input_dim, classes) in [((3, 16, 16), 3), ((1, 15, 13), 5), ((2, 8, 20), 2)] {
        let config = ConvNetConfig::tiny()
            .with_input_dim(input_dim)
            .with_num_classes(classes)
            .with_seed(11);
        let x = random_batch(5, input_dim, 12);

        let mut plain = ThreeLayerConvNet::<f64>::new(&config).unwrap();
        assert_eq!(plain.predict(&x).unwrap().dim(), (5, classes));

        let mut bn = BatchNormConvNet::<f64>::new(&config).unwrap();
        assert_eq!(bn.predict(&x).unwrap().dim(), (5, classes));
        assert_eq!(bn.forward_scores(&x, Mode::Training).unwrap().dim(), (5, classes));
    }
}

#[test]
fn gradient_keys_equal_parameter_keys() {
    let config = ConvNetConfig::tiny().with_seed(13);
    let x = random_batch(3, config.input_dim, 14);
    let labels = [2, 0, 1];

    let mut plain = ThreeLayerConvNet::<f64>::new(&config).unwrap();
    let (_, grads) = plain.loss(&x, &labels).unwrap();
    assert_eq!(grads.names(), plain.params.names());
    for (name, view) in plain.params.entries() {
        assert_eq!(grads.get(name).unwrap().shape(), view.shape(), "{}", name);
    }

    let mut bn = BatchNormConvNet::<f64>::new(&config).unwrap();
    let (_, grads) = bn.loss(&x, &labels).unwrap();
    assert_eq!(
        grads.names(),
        vec!["W1", "b1", "W2", "b2", "W3", "b3", "gamma1", "beta1", "gamma2", "beta2"]
    );
    assert_eq!(grads.num_params(), bn.params.num_params());
}

#[test]
fn regularization_touches_weights_only() {
    let base = ConvNetConfig::tiny().with_seed(17);
    let reg = 0.3;
    let x = random_batch(2, base.input_dim, 18);
    let labels = [0, 2];

    let mut raw = ThreeLayerConvNet::<f64>::new(&base.clone().with_reg(0.0)).unwrap();
    let mut regd = ThreeLayerConvNet::<f64>::new(&base.with_reg(reg)).unwrap();
    assert_eq!(raw.params, regd.params);

    let (raw_loss, raw_grads) = raw.loss(&x, &labels).unwrap();
    let (reg_loss, reg_grads) = regd.loss(&x, &labels).unwrap();

    let p = &raw.params;
    let sq = |w: f64| w * w;
    let penalty = 0.5 * reg * (p.w1.mapv(sq).sum() + p.w2.mapv(sq).sum() + p.w3.mapv(sq).sum());
    assert_abs_diff_eq!(reg_loss, raw_loss + penalty, epsilon = 1e-12);

    assert_eq!(reg_grads.b1, raw_grads.b1);
    assert_eq!(reg_grads.b2, raw_grads.b2);
    assert_eq!(reg_grads.b3, raw_grads.b3);
    for ((g, r), w) in reg_grads.w1.iter().zip(raw_grads.w1.iter()).zip(p.w1.iter()) {
        assert_abs_diff_eq!(*g, r + reg * w, epsilon = 1e-14);
    }
    for ((g, r), w) in reg_grads.w2.iter().zip(raw_grads.w2.iter()).zip(p.w2.iter()) {
        assert_abs_diff_eq!(*g, r + reg * w, epsilon = 1e-14);
    }
    for ((g, r), w) in reg_grads.w3.iter().zip(raw_grads.w3.iter()).zip(p.w3.iter()) {
        assert_abs_diff_eq!(*g, r + reg * w, epsilon = 1e-14);
    }
}

#[test]
fn batchnorm_scale_and_shift_are_not_regularized() {
    let base = ConvNetConfig::tiny().with_seed(19);
    let x = random_batch(4, base.input_dim, 20);
    let labels = [0, 1, 2, 0];
    let mut raw = BatchNormConvNet::<f64>::new(&base.clone().with_reg(0.0)).unwrap();
    let mut regd = BatchNormConvNet::<f64>::new(&base.with_reg(1.0)).unwrap();
    let (_, raw_grads) = raw.loss(&x, &labels).unwrap();
    let (_, reg_grads) = regd.loss(&x, &labels).unwrap();
    assert_eq!(reg_grads.gamma1, raw_grads.gamma1);
    assert_eq!(reg_grads.beta1, raw_grads.beta1);
    assert_eq!(reg_grads.gamma2, raw_grads.gamma2);
    assert_eq!(reg_grads.beta2, raw_grads.beta2);
    assert_ne!(reg_grads.w2, raw_grads.w2);
}

#[test]
fn batchnorm_inference_uses_running_statistics() {
    let config = ConvNetConfig::tiny().with_weight_scale(1e-1).with_seed(21);
    let mut net = BatchNormConvNet::<f64>::new(&config).unwrap();
    let x = random_batch(4, config.input_dim, 22);

    net.bn1.running_mean.fill(0.5);
    net.bn1.running_var.fill(4.0);
    net.bn2.running_mean.fill(-0.25);
    net.bn2.running_var.fill(9.0);
    let seeded = (net.bn1.clone(), net.bn2.clone());

    let inference = net.predict(&x).unwrap();
    assert_eq!(net.bn1.running_mean, seeded.0.running_mean);
    assert_eq!(net.bn2.running_var, seeded.1.running_var);
    assert_eq!(net.predict(&x).unwrap(), inference);

    let training = net.forward_scores(&x, Mode::Training).unwrap();
    assert!(max_abs_diff(&inference, &training) > 1e-3);
    assert_ne!(net.bn1.running_mean, seeded.0.running_mean);
}

#[test]
fn batchnorm_inference_matches_training_when_stats_agree() {
    // momentum 0 copies the batch statistics into the running statistics
    let mut config = ConvNetConfig::tiny().with_weight_scale(1e-1).with_seed(23);
    config.bn_momentum = 0.0;
    let mut net = BatchNormConvNet::<f64>::new(&config).unwrap();
    let x = random_batch(4, config.input_dim, 24);

    let training = net.forward_scores(&x, Mode::Training).unwrap();
    let inference = net.predict(&x).unwrap();
    assert!(max_abs_diff(&training, &inference) < 1e-9);
}

#[test]
fn evaluate_dispatches_on_labels() {
    let config = ConvNetConfig::tiny().with_seed(25);
    let mut net = BatchNormConvNet::<f64>::new(&config).unwrap();
    let x = random_batch(2, config.input_dim, 26);

    let before = net.bn1.running_mean.clone();
    assert!(matches!(net.evaluate(&x, None).unwrap(), Evaluation::Scores(_)));
    assert_eq!(net.bn1.running_mean, before);
    assert!(matches!(
        net.evaluate(&x, Some(&[1, 1][..])).unwrap(),
        Evaluation::LossAndGrads { .. }
    ));
    assert!(net.evaluate(&x, Some(&[1, 3][..])).is_err());
}

#[test]
fn loss_is_stable_across_precisions() {
    let config = ConvNetConfig::tiny().with_weight_scale(5e-2).with_reg(0.1).with_seed(27);
    let x64 = random_batch(3, config.input_dim, 28);
    let x32 = x64.mapv(|v| v as f32);
    let config32 = config.clone().with_precision(Precision::F32);
    let labels = [2, 1, 0];

    let (l64, _) = ThreeLayerConvNet::<f64>::new(&config).unwrap().loss(&x64, &labels).unwrap();
    let (l32, _) = ThreeLayerConvNet::<f32>::new(&config32).unwrap().loss(&x32, &labels).unwrap();
    assert_abs_diff_eq!(l64, l32 as f64, epsilon = 1e-4);

    let (l64, _) = BatchNormConvNet::<f64>::new(&config).unwrap().loss(&x64, &labels).unwrap();
    let (l32, _) = BatchNormConvNet::<f32>::new(&config32).unwrap().loss(&x32, &labels).unwrap();
    assert_abs_diff_eq!(l64, l32 as f64, epsilon = 1e-4);
}

#[test]
fn seeded_initialization_is_deterministic() {
    let config = ConvNetConfig::tiny().with_seed(29);
    let a = ThreeLayerConvNet::<f64>::new(&config).unwrap();
    let b = ThreeLayerConvNet::<f64>::new(&config).unwrap();
    assert_eq!(a.params, b.params);

    let c = ThreeLayerConvNet::<f64>::new(&config.clone().with_seed(30)).unwrap();
    assert_ne!(a.params.w1, c.params.w1);

    let config32 = config.with_precision(Precision::F32);
    let bn_a = BatchNormConvNet::<f32>::new(&config32).unwrap();
    let bn_b = BatchNormConvNet::<f32>::new(&config32).unwrap();
    assert_eq!(bn_a.params, bn_b.params);
}

#[test]
fn precision_must_match_config() {
    let config = ConvNetConfig::tiny().with_seed(33);
    assert!(matches!(
        ThreeLayerConvNet::<f32>::new(&config),
        Err(NetError::InvalidConfig(_))
    ));
    assert!(BatchNormConvNet::<f32>::new(&config).is_err());
    assert!(BatchNormConvNet::<f64>::new(&config.with_precision(Precision::F64)).is_ok());
}

#[test]
fn failed_calls_leave_batchnorm_state_alone() {
    let config = ConvNetConfig::tiny().with_seed(35);
    let mut net = BatchNormConvNet::<f64>::new(&config).unwrap();
    let x = random_batch(2, config.input_dim, 36);
    net.loss(&x, &[0, 2]).unwrap();
    let snapshot = (net.bn1.clone(), net.bn2.clone());
    let unchanged = |net: &BatchNormConvNet<f64>| {
        net.bn1.running_mean == snapshot.0.running_mean
            && net.bn1.running_var == snapshot.0.running_var
            && net.bn2.running_mean == snapshot.1.running_mean
            && net.bn2.running_var == snapshot.1.running_var
    };

    assert!(matches!(
        net.loss(&x, &[0, 9]),
        Err(NetError::LabelOutOfRange { label: 9, num_classes: 3 })
    ));
    assert!(unchanged(&net));

    assert!(net.evaluate(&x, Some(&[1, 3][..])).is_err());
    assert!(unchanged(&net));

    let wrong_hw = random_batch(2, (3, 12, 16), 37);
    assert!(matches!(net.loss(&wrong_hw, &[0, 1]), Err(NetError::ShapeMismatch { .. })));
    assert!(net.forward_scores(&wrong_hw, Mode::Training).is_err());
    assert!(unchanged(&net));

    assert!(matches!(
        net.loss(&Array4::zeros((0, 3, 16, 16)), &[]),
        Err(NetError::EmptyBatch)
    ));
    assert!(unchanged(&net));
}

#[test]
fn empty_batch_is_reported() {
    let config = ConvNetConfig::tiny().with_seed(39);
    let empty = Array4::<f64>::zeros((0, 3, 16, 16));
    let mut plain = ThreeLayerConvNet::<f64>::new(&config).unwrap();
    assert!(matches!(plain.predict(&empty), Err(NetError::EmptyBatch)));
    let mut bn = BatchNormConvNet::<f64>::new(&config).unwrap();
    assert!(matches!(bn.predict(&empty), Err(NetError::EmptyBatch)));
}

#[test]
fn gradient_step_through_param_adapter_lowers_loss() {
    let config = ConvNetConfig::tiny().with_weight_scale(5e-2).with_reg(1e-3).with_seed(31);
    let mut net = ThreeLayerConvNet::<f64>::new(&config).unwrap();
    let x = random_batch(4, config.input_dim, 32);
    let labels = [0, 1, 2, 1];

    let (initial, _) = net.loss(&x, &labels).unwrap();
    for _ in 0..10 {
        let (_, grads) = net.loss(&x, &labels).unwrap();
        net.params.update_with(&grads, |_, mut param, grad| {
            param.scaled_add(-0.1, &grad);
        });
    }
    let (last, _) = net.loss(&x, &labels).unwrap();
    assert!(last < initial, "loss went from {} to {}", initial, last);
}
