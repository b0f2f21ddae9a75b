use leakcheck::CheckerEngine;
use leakcheck::create_default_engine;
use leakcheck::diagnostics::Diagnostic;
use leakcheck::model::{FieldDecl, MethodDecl, ParamDecl, Program, TypeDecl};

fn check(program: &Program) -> Vec<Diagnostic> {
    create_default_engine()
        .check_program(program)
        .expect("checking should succeed")
}

fn keys(diags: &[Diagnostic]) -> Vec<&'static str> {
    diags.iter().map(|d| d.message.key).collect()
}

fn sock() -> TypeDecl {
    TypeDecl::new("Sock").must_call(["close"])
}

#[test]
fn static_final_owning_field_is_accepted_under_either_option() {
    let mk = || {
        Program::new(vec![
            sock(),
            TypeDecl::new("Holder")
                .field(FieldDecl::new("shared", "Sock").owning().static_final()),
        ])
    };

    assert!(check(&mk()).is_empty());

    let engine = CheckerEngine::builder()
        .permit_static_owning(true)
        .build()
        .expect("build");
    assert!(engine.check_program(&mk()).expect("check").is_empty());
}

#[test]
fn skipped_field_filter_suppresses_the_owning_field_check() {
    let program = Program::new(vec![
        sock(),
        TypeDecl::new("Holder").field(FieldDecl::new("sock", "Sock").owning()),
    ]);

    assert_eq!(keys(&check(&program)), vec!["required.method.not.called"]);

    let engine = CheckerEngine::builder()
        .skipped_fields(["Holder.sock".to_string()])
        .build()
        .expect("build");
    assert!(engine.check_program(&program).expect("check").is_empty());
}

#[test]
fn matching_owning_params_across_override_are_accepted() {
    let program = Program::new(vec![
        sock(),
        TypeDecl::new("Base").method(
            MethodDecl::new("take")
                .param(ParamDecl::new("a", "Sock").owning())
                .param(ParamDecl::new("b", "Sock").owning()),
        ),
        TypeDecl::new("Sub").extends("Base").method(
            MethodDecl::new("take")
                .param(ParamDecl::new("x", "Sock").owning())
                .param(ParamDecl::new("y", "Sock").owning()),
        ),
    ]);

    assert!(check(&program).is_empty());
}

#[test]
fn override_widening_cmcf_targets_is_accepted() {
    let program = Program::new(vec![
        TypeDecl::new("Res")
            .must_call(["close"])
            .field(FieldDecl::new("spare", "Res"))
            .method(MethodDecl::new("reopen").creates_must_call(["this"])),
        TypeDecl::new("SubRes")
            .extends("Res")
            .method(MethodDecl::new("reopen").creates_must_call(["this", "this.spare"])),
    ]);

    assert!(check(&program).is_empty());
}

#[test]
fn declaration_findings_do_not_mask_each_other() {
    let program = Program::new(vec![
        sock(),
        TypeDecl::new("Base")
            .method(MethodDecl::new("take").param(ParamDecl::new("s", "Sock").owning()))
            .method(MethodDecl::new("peek").returns("Sock").not_owning_return()),
        TypeDecl::new("Sub")
            .extends("Base")
            .method(MethodDecl::new("take").param(ParamDecl::new("s", "Sock")))
            .method(MethodDecl::new("peek").returns("Sock")),
    ]);

    let mut found = keys(&check(&program));
    found.sort_unstable();
    assert_eq!(found, vec!["owning.override.param", "owning.override.return"]);
}

#[test]
fn rerunning_the_engine_produces_the_identical_multiset() {
    let program = Program::new(vec![
        sock(),
        TypeDecl::new("Holder").field(FieldDecl::new("sock", "Sock").owning()),
        TypeDecl::new("Base")
            .method(MethodDecl::new("take").param(ParamDecl::new("s", "Sock").owning())),
        TypeDecl::new("Sub")
            .extends("Base")
            .method(MethodDecl::new("take").param(ParamDecl::new("s", "Sock"))),
    ]);

    let first: Vec<String> = check(&program).iter().map(Diagnostic::render).collect();
    let second: Vec<String> = check(&program).iter().map(Diagnostic::render).collect();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}
