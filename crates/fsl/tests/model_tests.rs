// Model factory, prototype heads and checkpoint tests

use std::path::PathBuf;

use fsl::backbone::{Backbone, BackboneRegistry, ConfigBackbone};
use fsl::checkpoint;
use fsl::episode::{synthetic_task, EpisodeConfig};
use fsl::finetune::{ProtoNetAutoFinetune, ProtoNetFinetune, AUTO_LR_CANDIDATES};
use fsl::model::{get_model, FewShotModel, ModelArgs};
use fsl::protonet::{prototypes, ProtoNet};
use fsl::{CpuBackend, CpuDevice, CpuTensor, DType, Error};
use fsl_meta::{LayerConfig, ParameterCollection, Task};
use rand::rngs::StdRng;
use rand::SeedableRng;

// Helpers

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn tiny_config() -> LayerConfig {
    LayerConfig::from_json(
        r#"[["conv2d", [4, 3, 3, 3, 1, 1]], ["bn", [4]], ["relu", []],
            ["max_pool2d", [2, 2, 0]], ["flatten", []]]"#,
    )
    .unwrap()
}

fn registry() -> BackboneRegistry<CpuBackend> {
    let mut registry = BackboneRegistry::new();
    registry.register("tiny", |args, dtype, device| {
        ConfigBackbone::initialize("tiny", tiny_config(), &args.input_dims(), dtype, device)
    });
    registry
}

fn tiny_args(deploy: &str) -> ModelArgs {
    ModelArgs {
        arch: "tiny".into(),
        deploy: deploy.into(),
        num_ways: 3,
        ada_steps: 3,
        ada_lr: 0.05,
        image_size: 8,
        ..ModelArgs::default()
    }
}

fn tiny_task(seed: u64, k_shot: usize) -> Task<CpuBackend> {
    let config = EpisodeConfig {
        n_way: 3,
        k_shot,
        n_query: 2,
        image_dims: [3, 8, 8],
        noise: 0.3,
    };
    synthetic_task(&mut StdRng::seed_from_u64(seed), &config, DType::F64, &CpuDevice).unwrap()
}

fn tiny_head() -> ProtoNet<CpuBackend> {
    let backbone = registry()
        .load(&tiny_args("vanilla"), DType::F64, &CpuDevice)
        .unwrap();
    ProtoNet::new(backbone, 3, DType::F64, &CpuDevice).unwrap()
}

fn snapshot(params: &ParameterCollection<CpuBackend>) -> Vec<Vec<f64>> {
    params.tensors().iter().map(|t| t.to_f64_vec().unwrap()).collect()
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("fsl_{}_{}.fslp", name, std::process::id()))
}

// Backbone registry

#[test]
fn test_builtin_conv4_backbone() {
    let backbone = registry()
        .load(&ModelArgs::default(), DType::F32, &CpuDevice)
        .unwrap();
    assert_eq!(backbone.name(), "conv4");
    // 84 -> 42 -> 21 -> 10 -> 5, 64 channels
    assert_eq!(backbone.embed_dim(), 64 * 5 * 5);
    assert_eq!(backbone.params().len(), 4 * 6);
}

#[test]
fn test_registry_names() {
    let registry = registry();
    let names: Vec<&str> = registry.names().collect();
    assert_eq!(names, vec!["conv4", "resnet18", "tiny"]);
    assert!(registry.contains("resnet18"));
    assert!(!registry.contains("dino_small_patch16"));
}

#[test]
fn test_external_arch_needs_loader() {
    let args = ModelArgs {
        arch: "dino_small_patch16".into(),
        ..ModelArgs::default()
    };
    match registry().load(&args, DType::F32, &CpuDevice) {
        Err(Error::UnknownBackbone { name, reason }) => {
            assert_eq!(name, "dino_small_patch16");
            assert!(reason.contains("external loader"));
        }
        other => panic!("expected UnknownBackbone, got {:?}", other.map(|b| b.name().to_string())),
    }
}

#[test]
fn test_unknown_arch_not_considered() {
    let args = ModelArgs {
        arch: "alexnet".into(),
        ..ModelArgs::default()
    };
    match registry().load(&args, DType::F32, &CpuDevice) {
        Err(Error::UnknownBackbone { reason, .. }) => assert!(reason.contains("not considered")),
        other => panic!("expected UnknownBackbone, got {:?}", other.map(|b| b.name().to_string())),
    }
}

#[test]
fn test_resnet18_requires_no_pretrain() {
    let args = ModelArgs {
        arch: "resnet18".into(),
        image_size: 224,
        ..ModelArgs::default()
    };
    assert!(matches!(
        registry().load(&args, DType::F32, &CpuDevice),
        Err(Error::UnknownBackbone { .. })
    ));
}

// Model factory

#[test]
fn test_get_model_dispatch() {
    let registry = registry();
    let make = |deploy: &str| get_model(&tiny_args(deploy), &registry, DType::F64, &CpuDevice);
    assert_eq!(make("vanilla").unwrap().name(), "protonet");
    assert_eq!(make("finetune").unwrap().name(), "protonet_finetune");
    assert_eq!(make("finetune_autolr").unwrap().name(), "protonet_auto_finetune");
    for deploy in ["ada_tokens", "ada_tokens_entmin", "linear_probe"] {
        assert!(matches!(make(deploy), Err(Error::UnsupportedDeploy { .. })));
    }
}

#[test]
fn test_augmentation_is_unsupported() {
    let args = ModelArgs {
        aug_prob: 0.9,
        aug_types: vec!["color".into(), "translation".into()],
        ..tiny_args("finetune")
    };
    assert!(matches!(
        get_model(&args, &registry(), DType::F64, &CpuDevice),
        Err(Error::UnsupportedDeploy { .. })
    ));
}

#[test]
fn test_maml_deploy_predicts_query_logits() {
    let args = ModelArgs {
        deploy: "maml".into(),
        num_ways: 3,
        finetune_steps: 2,
        ..ModelArgs::default()
    };
    let model = get_model::<CpuBackend>(&args, &registry(), DType::F32, &CpuDevice).unwrap();
    let learner = model.as_meta().unwrap();
    assert_eq!(learner.embed_dim(), 288);
    assert_eq!(learner.params().len(), 4 * 6 + 2);

    let episode = EpisodeConfig {
        n_way: 3,
        k_shot: 1,
        n_query: 2,
        ..EpisodeConfig::default()
    };
    let task = synthetic_task(&mut StdRng::seed_from_u64(3), &episode, DType::F32, &CpuDevice).unwrap();
    let logits = model.predict(&task).unwrap();
    assert_eq!(logits.dims(), &[6, 3]);
}

#[test]
fn test_resnet_deploy_rejects_small_images() {
    let args = ModelArgs {
        deploy: "resnet".into(),
        ..ModelArgs::default()
    };
    // the final 7x7 average pool does not fit an 84x84 input
    assert!(matches!(
        get_model::<CpuBackend>(&args, &registry(), DType::F32, &CpuDevice),
        Err(Error::Meta(fsl_meta::Error::Shape { .. }))
    ));
}

// ProtoNet

#[test]
fn test_prototypes_are_class_means() {
    let f = CpuTensor::from_f64_slice(
        &[1.0, 0.0, 0.0, 2.0, 3.0, 0.0, 0.0, 4.0],
        (4, 2),
        DType::F64,
        &CpuDevice,
    )
    .unwrap();
    let protos = prototypes(&f, &[0, 1, 0, 1], 2).unwrap();
    assert_eq!(protos.to_f64_vec().unwrap(), vec![2.0, 0.0, 0.0, 3.0]);
    assert!(matches!(
        prototypes(&f, &[0, 0, 0, 0], 2),
        Err(Error::Meta(fsl_meta::Error::InvalidTask(_)))
    ));
}

#[test]
fn test_cosine_classifier_scale_and_bias() {
    let head = tiny_head();
    assert_eq!(head.scale_cls().to_scalar_f64().unwrap(), 10.0);
    assert_eq!(head.bias().to_scalar_f64().unwrap(), 0.0);

    let protos = CpuTensor::from_f64_slice(&[2.0, 0.0, 0.0, 0.5], (2, 2), DType::F64, &CpuDevice).unwrap();
    let f = CpuTensor::from_f64_slice(&[1.0, 0.0, 1.0, 1.0], (2, 2), DType::F64, &CpuDevice).unwrap();
    let logits = head.cos_classifier(&protos, &f).unwrap().to_f64_vec().unwrap();
    let diag = 10.0 / 2f64.sqrt();
    for (got, want) in logits.iter().zip([10.0, 0.0, diag, diag]) {
        assert!(approx_eq(*got, want, 1e-9), "{} vs {}", got, want);
    }
}

#[test]
fn test_protonet_predict_shape() {
    let head = tiny_head();
    let logits = head.predict(&tiny_task(1, 2)).unwrap();
    assert_eq!(logits.dims(), &[6, 3]);
}

// Fine-tuning heads

#[test]
fn test_finetune_without_steps_or_lr_is_protonet() {
    let task = tiny_task(2, 2);

    let no_steps = ProtoNetFinetune::new(tiny_head(), 0, 0.05, 0.9);
    let expected = no_steps.head().predict(&task).unwrap().to_f64_vec().unwrap();
    assert_eq!(no_steps.predict(&task).unwrap().to_f64_vec().unwrap(), expected);

    let zero_lr = ProtoNetFinetune::new(tiny_head(), 3, 0.05, 0.9);
    let expected = zero_lr.head().predict(&task).unwrap().to_f64_vec().unwrap();
    assert_eq!(
        zero_lr.predict_with_lr(&task, 0.0).unwrap().to_f64_vec().unwrap(),
        expected
    );
}

#[test]
fn test_finetune_never_mutates_backbone() {
    let task = tiny_task(3, 2);
    let finetune = ProtoNetFinetune::new(tiny_head(), 3, 0.1, 0.9);
    let before = snapshot(finetune.head().backbone().params());
    let plain = finetune.head().predict(&task).unwrap().to_f64_vec().unwrap();

    let tuned = finetune.predict(&task).unwrap().to_f64_vec().unwrap();
    assert_eq!(snapshot(finetune.head().backbone().params()), before);
    assert_ne!(tuned, plain);

    let fast = finetune.finetuned_params(&task, 0.1).unwrap();
    assert!(!fast.shares_storage_with(finetune.head().backbone().params()));
}

#[test]
fn test_auto_lr_picks_a_candidate() {
    let auto = ProtoNetAutoFinetune::new(tiny_head(), 2, 0.9);
    assert_eq!(auto.candidates(), &AUTO_LR_CANDIDATES);
    let lr = auto.select_lr(&tiny_task(4, 4)).unwrap();
    assert!(AUTO_LR_CANDIDATES.contains(&lr));
    assert_eq!(auto.predict(&tiny_task(4, 4)).unwrap().dims(), &[6, 3]);
}

#[test]
fn test_auto_lr_one_shot_does_not_finetune() {
    let auto = ProtoNetAutoFinetune::new(tiny_head(), 2, 0.9);
    assert_eq!(auto.select_lr(&tiny_task(5, 1)).unwrap(), 0.0);
}

#[test]
fn test_model_predict_matches_head() {
    let model = get_model(&tiny_args("vanilla"), &registry(), DType::F64, &CpuDevice).unwrap();
    let task = tiny_task(6, 2);
    let via_model = model.predict(&task).unwrap().to_f64_vec().unwrap();
    let FewShotModel::ProtoNet(head) = &model else {
        panic!("expected ProtoNet");
    };
    assert_eq!(head.predict(&task).unwrap().to_f64_vec().unwrap(), via_model);
}

// Checkpoints

#[test]
fn test_checkpoint_roundtrip_file() {
    let config = tiny_config();
    let params = ParameterCollection::<CpuBackend>::initialize(&config, DType::F32, &CpuDevice).unwrap();
    let path = temp_path("roundtrip");
    checkpoint::save_params(&path, &params).unwrap();
    let loaded = checkpoint::load_params::<CpuBackend>(&path, &config, &CpuDevice).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(snapshot(&loaded), snapshot(&params));
    assert!(!loaded.shares_storage_with(&params));
    assert!(loaded.trainable().iter().all(|t| t.is_variable()));
}

#[test]
fn test_checkpoint_rejects_other_config() {
    let params = ParameterCollection::<CpuBackend>::initialize(&tiny_config(), DType::F32, &CpuDevice).unwrap();
    let bytes = checkpoint::to_bytes(&params).unwrap();

    let wider = LayerConfig::from_json(
        r#"[["conv2d", [8, 3, 3, 3, 1, 1]], ["bn", [8]], ["relu", []],
            ["max_pool2d", [2, 2, 0]], ["flatten", []]]"#,
    )
    .unwrap();
    assert!(matches!(
        checkpoint::from_bytes::<CpuBackend>(&bytes, &wider, &CpuDevice),
        Err(Error::Checkpoint(_))
    ));

    let shorter = LayerConfig::from_json(r#"[["conv2d", [4, 3, 3, 3, 1, 1]]]"#).unwrap();
    assert!(matches!(
        checkpoint::from_bytes::<CpuBackend>(&bytes, &shorter, &CpuDevice),
        Err(Error::Checkpoint(_))
    ));

    let mut corrupt = bytes.clone();
    corrupt[0] = b'X';
    assert!(matches!(
        checkpoint::from_bytes::<CpuBackend>(&corrupt, &tiny_config(), &CpuDevice),
        Err(Error::Checkpoint(_))
    ));
}

#[test]
fn test_pretrained_checkpoint_is_applied() {
    let source = registry().load(&tiny_args("vanilla"), DType::F64, &CpuDevice).unwrap();
    let path = temp_path("pretrained");
    checkpoint::save_params(&path, source.params()).unwrap();

    let args = ModelArgs {
        pretrained: Some(path.clone()),
        ..tiny_args("vanilla")
    };
    let loaded = registry().load(&args, DType::F64, &CpuDevice).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(snapshot(loaded.params()), snapshot(source.params()));
}
