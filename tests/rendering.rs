use insta::assert_snapshot;
use leakcheck::create_default_engine;
use leakcheck::model::{FieldDecl, Program, TypeDecl};

fn single_finding() -> leakcheck::diagnostics::Diagnostic {
    let program = Program::new(vec![
        TypeDecl::new("Closeable").must_call(["close"]),
        TypeDecl::new("Leaky").field(FieldDecl::new("res", "Closeable").owning()),
    ]);
    let mut diags = create_default_engine()
        .check_program(&program)
        .expect("checking should succeed");
    assert_eq!(diags.len(), 1);
    diags.remove(0)
}

#[test]
fn human_rendering_is_stable() {
    let diag = single_finding();
    assert_snapshot!(
        diag.render(),
        @"error: [required.method.not.called] Leaky.res: field `res` carries obligations (close) but `Leaky` declares no must-call method that could release them"
    );
}

#[test]
fn json_rendering_is_stable() {
    let diag = single_finding();
    let rendered = serde_json::to_string_pretty(&diag.to_json()).expect("serialize");
    assert_eq!(
        rendered,
        r#"{
  "category": "declaration",
  "element": "Leaky.res",
  "help": null,
  "key": "required.method.not.called",
  "level": "error",
  "message": "field `res` carries obligations (close) but `Leaky` declares no must-call method that could release them",
  "point": null
}"#
    );
}
