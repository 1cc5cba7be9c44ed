// File: tests/interpreter_tests.rs
//
// End-to-end tests running full Lox programs through the compiler and
// VM. Each program stashes its interesting value in a global so the
// test can read it back with `Vm::get_global` instead of scraping
// stdout.

use loxvm::builtins;
use loxvm::value::Value;
use loxvm::vm::{InterpretError, Vm};
use pretty_assertions::assert_eq;

fn run(source: &str) -> Vm {
    let mut vm = Vm::new();
    builtins::install(&mut vm);
    vm.interpret(source).unwrap_or_else(|e| panic!("program failed: {e}"));
    vm
}

fn number_global(vm: &mut Vm, name: &str) -> f64 {
    match vm.get_global(name) {
        Some(Value::Number(n)) => n,
        other => panic!("expected a number global '{name}', got {other:?}"),
    }
}

#[test]
fn arithmetic_with_grouping_and_precedence() {
    let mut vm = run("var result = (10 + 20) / (2 * 5);");
    assert_eq!(number_global(&mut vm, "result"), 3.0);
}

#[test]
fn equality_of_an_arithmetic_expression() {
    let mut vm = run("var a = 1; var b = 2; var result = (a + b) == 3;");
    assert!(matches!(vm.get_global("result"), Some(Value::Bool(true))));
}

#[test]
fn for_loop_accumulates_a_running_sum() {
    let mut vm = run(
        "var sum = 0; for (var i = 1; i <= 10; i = i + 1) sum = sum + i; var result = sum;",
    );
    assert_eq!(number_global(&mut vm, "result"), 55.0);
}

#[test]
fn recursive_fibonacci() {
    let mut vm = run(
        "fun fib(n) { if (n <= 1) return n; return fib(n-1) + fib(n-2); } var result = fib(10);",
    );
    assert_eq!(number_global(&mut vm, "result"), 55.0);
}

#[test]
fn closures_keep_their_own_captured_state() {
    let mut vm = run(
        "fun counter(){ var i = 0; fun next(){ i = i + 1; return i; } return next; } \
         var c = counter(); c(); c(); var result = c();",
    );
    assert_eq!(number_global(&mut vm, "result"), 3.0);
}

#[test]
fn super_call_resolves_against_the_lexically_enclosing_classs_superclass() {
    let mut vm = run(
        "class A { greet(){ return \"A\"; } } \
         class B < A { greet(){ return super.greet() + \"B\"; } } \
         var result = B().greet();",
    );
    match vm.get_global("result") {
        Some(Value::Object(h)) => assert_eq!(vm.heap.as_str(h), "AB"),
        other => panic!("expected a string global, got {other:?}"),
    }
}

#[test]
fn native_list_class_supports_push_get_and_length() {
    let mut vm = run(
        "var l = List(); l.push(1); l.push(2); l.push(3); \
         var result = l.length(); var first = l.get(0);",
    );
    assert_eq!(number_global(&mut vm, "result"), 3.0);
    assert_eq!(number_global(&mut vm, "first"), 1.0);
}

#[test]
fn native_string_class_supports_append_and_upper() {
    let mut vm = run("var s = String(); s.append(\"hi\"); s.upper();");
    match vm.get_global("s") {
        Some(Value::Object(h)) => match vm.heap.get(h) {
            loxvm::object::Object::StringBuf(buf) => assert_eq!(buf.contents, "HI"),
            other => panic!("expected a StringBuf, got {other:?}"),
        },
        other => panic!("expected a global 's', got {other:?}"),
    }
}

#[test]
fn undefined_variable_reported_as_a_runtime_error() {
    let mut vm = Vm::new();
    builtins::install(&mut vm);
    let err = vm.interpret("print nope;").unwrap_err();
    match err {
        InterpretError::Runtime(e) => assert!(e.message.contains("Undefined variable")),
        other => panic!("expected a runtime error, got {other}"),
    }
}

#[test]
fn missing_semicolon_reported_as_a_compile_error() {
    let mut vm = Vm::new();
    builtins::install(&mut vm);
    let err = vm.interpret("var x = 1").unwrap_err();
    assert!(matches!(err, InterpretError::Compile(_)));
}

#[test]
fn calling_a_class_as_init_requires_the_declared_arity() {
    let mut vm = Vm::new();
    builtins::install(&mut vm);
    let err = vm
        .interpret("class Point { __init__(x, y) { this.x = x; this.y = y; } } Point(1);")
        .unwrap_err();
    match err {
        InterpretError::Runtime(e) => assert!(e.message.contains("Expected 2 arguments")),
        other => panic!("expected a runtime error, got {other}"),
    }
}
