use aot_image::{
    AotConfig, AotContext, ApiFlag, Manifest, ManifestRuntime, NativeSession, SpecializationId,
    TableEntry, TargetConfig,
};

fn context(persistence: bool) -> AotContext {
    let _ = env_logger::builder().is_test(true).try_init();
    let target = TargetConfig::new("x86_64-unknown-linux-gnu".parse().unwrap());
    AotContext::new(AotConfig::default().with_target(target).with_persistence(persistence)).unwrap()
}

fn build(ctx: &AotContext, manifest: &str) -> (NativeSession, ManifestRuntime) {
    let mut runtime = Manifest::parse(manifest).unwrap().into_runtime();
    runtime.register_globals(ctx).unwrap();
    let roots = runtime.roots().to_vec();
    let session = ctx.create_session(&roots, runtime.revisions(), &mut runtime).unwrap();
    (session, runtime)
}

fn entry(api: u8, specialized: u32, generic: u32) -> TableEntry {
    TableEntry {
        api: ApiFlag(api),
        specialized,
        generic,
    }
}

#[test]
fn generic_only_root() {
    let ctx = context(true);
    let (session, _) = build(
        &ctx,
        "revision 1
         instance 1 r ret=Int64 api=2
         root 1",
    );
    assert_eq!(session.function_table(), &["r_generic_1".to_string()]);
    assert_eq!(session.table_indices_of(SpecializationId(1)), Some(entry(2, 0, 1)));
}

#[test]
fn specialized_and_generic_root() {
    let ctx = context(true);
    let (session, _) = build(
        &ctx,
        "revision 1
         instance 2 r2 ret=Int64 spec=Int64 api=1
         root 2",
    );
    assert_eq!(
        session.function_table(),
        &["r2_spec_2".to_string(), "r2_generic_2".to_string()]
    );
    assert_eq!(session.table_indices_of(SpecializationId(2)), Some(entry(1, 1, 2)));
}

#[test]
fn mismatched_specialization_is_left_out() {
    let ctx = context(true);
    let (session, _) = build(
        &ctx,
        "revision 1
         instance 3 r3 ret=Int64 spec=Float64
         root 3",
    );
    assert_eq!(session.function_table().len(), 1);
    assert_eq!(session.table_indices_of(SpecializationId(3)), Some(entry(0, 0, 1)));
}

#[test]
fn empty_roots() {
    let ctx = context(true);
    let (session, _) = build(&ctx, "revision 1\n");
    assert!(session.function_table().is_empty());
    assert!(session.global_table().is_empty());
    assert_eq!(session.stats().codegen_runs, 0);
}

#[test]
fn callees_join_the_function_table() {
    let ctx = context(true);
    let (session, runtime) = build(
        &ctx,
        "revision 4
         global 0x100
         instance 1 main calls=2,3 uses=0x100
         instance 2 left calls=3
         instance 3 right calls=1
         root 1",
    );
    assert_eq!(
        session.function_table(),
        &[
            "main_generic_1".to_string(),
            "left_generic_2".to_string(),
            "right_generic_3".to_string(),
        ]
    );
    for id in 1..=3 {
        assert_eq!(runtime.codegen_calls(SpecializationId(id)), 1);
    }
    assert_eq!(session.global_table(), &["jl_global#0".to_string()]);
}

#[test]
fn validity_window_spanning_both_passes_compiles_once() {
    let ctx = context(true);
    let (session, runtime) = build(
        &ctx,
        "revision 5
         inference-revision 6
         instance 1 stable valid=1..*
         root 1",
    );
    assert_eq!(runtime.codegen_calls(SpecializationId(1)), 1);
    assert_eq!(runtime.inference_calls(SpecializationId(1)), 1);
    assert_eq!(session.function_table().len(), 1);
}

#[test]
fn in_progress_only_callee_is_deferred() {
    let ctx = context(true);
    let (session, runtime) = build(
        &ctx,
        "revision 5
         inference-revision 6
         instance 1 caller valid=1..* calls=2
         instance 2 fresh valid=6..*
         instance 3 stale valid=1..3
         root 1 3",
    );
    assert_eq!(
        session.function_table(),
        &["caller_generic_1".to_string(), "fresh_generic_2".to_string()]
    );
    assert_eq!(runtime.codegen_calls(SpecializationId(2)), 1);
    assert!(session.stats().deferred >= 1);
    assert_eq!(session.table_indices_of(SpecializationId(3)), None);
    assert_eq!(runtime.codegen_calls(SpecializationId(3)), 0);
    assert_eq!(session.stats().omitted, 1);
}

#[test]
fn failures_are_omitted() {
    let ctx = context(true);
    let (session, _) = build(
        &ctx,
        "revision 1
         instance 1 ok
         instance 2 noinfer infer=fail
         instance 3 nocode codegen=fail
         root 1 2 3",
    );
    assert_eq!(session.function_table(), &["ok_generic_1".to_string()]);
    assert_eq!(session.table_indices_of(SpecializationId(2)), None);
    assert_eq!(session.table_indices_of(SpecializationId(3)), None);
    assert_eq!(session.stats().omitted, 2);
}

#[test]
fn cached_inference_skips_inference() {
    let ctx = context(true);
    let (session, runtime) = build(
        &ctx,
        "revision 1
         instance 1 a cached=code
         instance 2 b cached=compressed
         instance 3 c cached=broken
         instance 4 d cached=nothing
         root 1 2 3 4",
    );
    assert_eq!(runtime.inference_calls(SpecializationId(1)), 0);
    assert_eq!(runtime.inference_calls(SpecializationId(2)), 0);
    assert_eq!(runtime.inference_calls(SpecializationId(3)), 1);
    assert_eq!(runtime.inference_calls(SpecializationId(4)), 1);
    assert_eq!(session.stats().cache_hits, 2);
    assert_eq!(session.function_table().len(), 4);
}

#[test]
fn session_functions_are_internal() {
    let ctx = context(true);
    let (session, _) = build(
        &ctx,
        "revision 1
         instance 1 r spec=Any
         root 1",
    );
    for f in session.module().functions().filter(|f| !f.is_declaration()) {
        assert!(!f.linkage.is_external(), "{} should be internal", f.name);
    }
    // the shadow module is untouched by the session
    assert!(!ctx.shadow_snapshot().contains("r_generic_1"));
}

#[test]
fn recursive_instance_compiles() {
    let ctx = context(true);
    let (session, runtime) = build(
        &ctx,
        "revision 1
         instance 1 fib calls=1 api=1
         root 1",
    );
    assert_eq!(session.function_table(), &["fib_generic_1".to_string()]);
    assert_eq!(session.table_indices_of(SpecializationId(1)), Some(entry(1, 0, 1)));
    assert_eq!(runtime.codegen_calls(SpecializationId(1)), 1);
}

#[test]
fn failing_cycle_terminates() {
    let ctx = context(true);
    let (session, runtime) = build(
        &ctx,
        "revision 1
         instance 1 a calls=2 codegen=fail
         instance 2 b calls=1,2 codegen=fail
         instance 3 c calls=3,1
         root 1 3",
    );
    assert_eq!(session.function_table(), &["c_generic_3".to_string()]);
    assert_eq!(runtime.codegen_calls(SpecializationId(1)), 1);
    assert_eq!(runtime.codegen_calls(SpecializationId(2)), 1);
    assert_eq!(runtime.codegen_calls(SpecializationId(3)), 1);
    assert_eq!(session.stats().omitted, 2);
}
