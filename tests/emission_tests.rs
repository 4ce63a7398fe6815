use aot_image::emit::tables::{FUNCTION_TABLE, GLOBAL_TABLE, IMAGE_DATA, IMAGE_SIZE, UNIQUE_COUNTER};
use aot_image::{
    AotConfig, AotContext, EmitDiagnostic, EmitOptions, Manifest, NativeSession, OutputKind,
    PersistenceOutcome, TargetConfig,
};
use object::{Object, ObjectComdat, ObjectSymbol};
use std::fs;

const MANIFEST: &str = "
revision 2
global 0x1000
global 0x2000 jl_sym#
instance 1 main calls=2 uses=0x1000 api=1
instance 2 helper ret=Int64 spec=Int64 uses=0x2000
root 1
";

fn context(triple: &str, persistence: bool) -> AotContext {
    let _ = env_logger::builder().is_test(true).try_init();
    let target = TargetConfig::new(triple.parse().unwrap());
    AotContext::new(AotConfig::default().with_target(target).with_persistence(persistence)).unwrap()
}

fn session(ctx: &AotContext) -> NativeSession {
    let mut runtime = Manifest::parse(MANIFEST).unwrap().into_runtime();
    runtime.register_globals(ctx).unwrap();
    let roots = runtime.roots().to_vec();
    ctx.create_session(&roots, runtime.revisions(), &mut runtime).unwrap()
}

fn symbol_size(file: &object::File<'_>, name: &str) -> Option<u64> {
    file.symbols()
        .find(|s| s.name().ok() == Some(name))
        .map(|s| s.size())
}

#[test]
fn elf_object_carries_offset_tables() {
    let ctx = context("x86_64-unknown-linux-gnu", true);
    let session = session(&ctx);
    assert_eq!(session.global_table().len(), 2);
    assert_eq!(session.function_table().len(), 3);

    let dir = tempfile::tempdir().unwrap();
    let options = EmitOptions::new()
        .with_object(dir.path().join("image.o"))
        .with_optimized_ir(dir.path().join("image.ll"))
        .with_unoptimized_ir(dir.path().join("image-unopt.ll"));
    let report = ctx.emit_artifact(session, &options).unwrap();

    assert!(report.all_written());
    assert_eq!(report.persistence, PersistenceOutcome::Embedded);
    let kinds: Vec<_> = report.outputs.iter().map(|o| o.kind).collect();
    assert_eq!(kinds, vec![OutputKind::UnoptimizedIr, OutputKind::OptimizedIr, OutputKind::Object]);

    let bytes = fs::read(dir.path().join("image.o")).unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    assert_eq!(file.format(), object::BinaryFormat::Elf);
    assert_eq!(symbol_size(&file, GLOBAL_TABLE), Some(2 * 8));
    assert_eq!(symbol_size(&file, FUNCTION_TABLE), Some(3 * 8));
    assert_eq!(symbol_size(&file, UNIQUE_COUNTER), Some(8));
    assert!(symbol_size(&file, "rtld_default_handle_pointer").is_some());
    for name in ["main_generic_1", "helper_spec_2", "helper_generic_2"] {
        assert!(symbol_size(&file, name).is_some(), "missing {name}");
    }

    let ir = fs::read_to_string(dir.path().join("image.ll")).unwrap();
    assert!(ir.contains("target triple = \"x86_64-unknown-linux-gnu\""));
    assert!(ir.contains(&format!(
        "@{FUNCTION_TABLE} = external constant [3 x ptr] \
         [ptr @main_generic_1, ptr @helper_spec_2, ptr @helper_generic_2]"
    )));
    assert!(ir.contains(&format!(
        "@{GLOBAL_TABLE} = external constant [2 x ptr] [ptr @jl_global#0, ptr @jl_sym#1]"
    )));
    assert!(ir.contains(&format!("@{UNIQUE_COUNTER} = external constant i64 3")));
}

#[test]
fn payload_is_embedded_with_its_size() {
    let ctx = context("x86_64-unknown-linux-gnu", true);
    let session = session(&ctx);
    let dir = tempfile::tempdir().unwrap();
    let options = EmitOptions::new()
        .with_object(dir.path().join("image.o"))
        .with_payload(vec![0xaa; 100]);
    let report = ctx.emit_artifact(session, &options).unwrap();
    assert!(report.all_written());

    let bytes = fs::read(dir.path().join("image.o")).unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    assert_eq!(symbol_size(&file, IMAGE_DATA), Some(100));
    assert_eq!(symbol_size(&file, IMAGE_SIZE), Some(8));
    let data = file.symbols().find(|s| s.name().ok() == Some(IMAGE_DATA)).unwrap();
    assert_eq!(data.address() % 64, 0);
}

#[test]
fn tables_are_embedded_only_once() {
    let ctx = context("x86_64-unknown-linux-gnu", true);
    let first = session(&ctx);
    let second = session(&ctx);
    let dir = tempfile::tempdir().unwrap();

    let report = ctx
        .emit_artifact(first, &EmitOptions::new().with_object(dir.path().join("a.o")))
        .unwrap();
    assert_eq!(report.persistence, PersistenceOutcome::Embedded);
    assert!(!ctx.persistence_active());

    let report = ctx
        .emit_artifact(second, &EmitOptions::new().with_object(dir.path().join("b.o")))
        .unwrap();
    assert_eq!(report.persistence, PersistenceOutcome::AlreadyConsumed);
    assert!(report.all_written());

    let bytes = fs::read(dir.path().join("b.o")).unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    assert_eq!(symbol_size(&file, FUNCTION_TABLE), None);
    assert_eq!(symbol_size(&file, GLOBAL_TABLE), None);
}

#[test]
fn no_tables_without_persistence() {
    let ctx = context("x86_64-unknown-linux-gnu", false);
    let session = session(&ctx);
    assert!(session.global_table().is_empty());
    let dir = tempfile::tempdir().unwrap();
    let report = ctx
        .emit_artifact(session, &EmitOptions::new().with_unoptimized_ir(dir.path().join("u.ll")))
        .unwrap();
    assert_eq!(report.persistence, PersistenceOutcome::NotRequested);

    let ir = fs::read_to_string(dir.path().join("u.ll")).unwrap();
    assert!(!ir.contains(FUNCTION_TABLE));
    assert!(ir.contains("define internal @main_generic_1"));
}

#[test]
fn unopenable_destination_is_skipped() {
    let ctx = context("x86_64-unknown-linux-gnu", true);
    let session = session(&ctx);
    let dir = tempfile::tempdir().unwrap();
    let options = EmitOptions::new()
        .with_object(dir.path().join("missing").join("image.o"))
        .with_optimized_ir(dir.path().join("image.ll"));
    let report = ctx.emit_artifact(session, &options).unwrap();

    assert!(!report.all_written());
    assert!(report.output(OutputKind::OptimizedIr).unwrap().is_written());
    let object = report.output(OutputKind::Object).unwrap();
    assert!(matches!(object.diagnostic(), Some(EmitDiagnostic::OpenOutput { .. })));
    assert!(fs::read_to_string(dir.path().join("image.ll")).unwrap().contains(FUNCTION_TABLE));
}

#[test]
fn empty_session_emits_empty_tables() {
    let ctx = context("x86_64-unknown-linux-gnu", true);
    let session = ctx
        .create_session(&[], aot_image::Revisions::new(1), &mut Manifest::parse("").unwrap().into_runtime())
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let report = ctx
        .emit_artifact(session, &EmitOptions::new().with_object(dir.path().join("e.o")))
        .unwrap();
    assert!(report.all_written());

    let bytes = fs::read(dir.path().join("e.o")).unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    assert_eq!(symbol_size(&file, FUNCTION_TABLE), Some(0));
    assert_eq!(symbol_size(&file, GLOBAL_TABLE), Some(0));
}

#[test]
fn no_destinations_still_consumes_tables() {
    let ctx = context("x86_64-unknown-linux-gnu", true);
    let session = session(&ctx);
    let report = ctx.emit_artifact(session, &EmitOptions::new()).unwrap();
    assert!(report.outputs.is_empty());
    assert_eq!(report.persistence, PersistenceOutcome::Embedded);
}

#[test]
fn coff_x86_64_object_has_comdats_and_unwind_info() {
    let ctx = context("x86_64-pc-windows-msvc", true);
    let session = session(&ctx);
    for f in session.module().functions().filter(|f| !f.is_declaration()) {
        assert!(f.comdat.is_some(), "{} has no comdat", f.name);
        assert_eq!(f.personality.as_deref(), Some("__runtime_personality"));
    }

    let dir = tempfile::tempdir().unwrap();
    let options = EmitOptions::new()
        .with_object(dir.path().join("image.obj"))
        .with_optimized_ir(dir.path().join("image.ll"));
    let report = ctx.emit_artifact(session, &options).unwrap();
    assert!(report.all_written());

    let bytes = fs::read(dir.path().join("image.obj")).unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    assert_eq!(file.format(), object::BinaryFormat::Coff);
    assert!(file.comdats().count() >= 3);
    // duplicates across merged objects resolve to the first definition
    assert!(file.comdats().all(|c| c.kind() == object::ComdatKind::Any));
    assert!(file.section_by_name(".pdata").is_some());
    assert!(file.section_by_name(".xdata").is_some());
    assert!(symbol_size(&file, FUNCTION_TABLE).is_some());

    let ir = fs::read_to_string(dir.path().join("image.ll")).unwrap();
    assert!(ir.contains(&format!("@{FUNCTION_TABLE} = external dllexport constant")));
}

#[test]
fn unsupported_target_skips_only_the_object() {
    let ctx = context("wasm32-unknown-unknown", true);
    let session = session(&ctx);
    let dir = tempfile::tempdir().unwrap();
    let options = EmitOptions::new()
        .with_object(dir.path().join("image.o"))
        .with_unoptimized_ir(dir.path().join("image.ll"));
    let report = ctx.emit_artifact(session, &options).unwrap();

    assert!(report.output(OutputKind::UnoptimizedIr).unwrap().is_written());
    let object = report.output(OutputKind::Object).unwrap();
    assert!(matches!(object.diagnostic(), Some(EmitDiagnostic::UnsupportedTarget { .. })));
}
