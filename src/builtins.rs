// File: src/builtins.rs
//
// The standard library: native functions registered into the VM's
// global namespace, plus the method dispatch for the two native
// collection types (`List`, `String`) that back onto `Object::List` and
// `Object::StringBuf` rather than user-defined classes.

use crate::gc::{Heap, ObjRef};
use crate::object::{ListObj, Object, StringBufObj};
use crate::value::Value;
use crate::vm::Vm;

/// Registers every native function and native-class constructor into
/// `vm`'s global namespace. Called once, right after `Vm::new()`.
pub fn install(vm: &mut Vm) {
    vm.define_native("clock", 0, native_clock);
    vm.define_native("sin", 1, native_sin);
    vm.define_native("print", 1, native_print);
    vm.define_native("println", 1, native_println);
    vm.define_native("help", 0, native_help);
    vm.define_native("List", 0, native_list_new);
    vm.define_native("String", 0, native_string_new);
}

fn native_clock(_vm: &mut Vm, _args: &[Value]) -> Value {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Value::Number(elapsed.as_secs_f64())
}

fn native_sin(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0].as_number() {
        Some(n) => Value::Number(n.sin()),
        None => {
            vm.last_native_error = Some("sin() expects a number argument.".to_string());
            Value::Error
        }
    }
}

fn native_print(vm: &mut Vm, args: &[Value]) -> Value {
    print!("{}", vm.format_value(args[0]));
    Value::Nil
}

fn native_println(vm: &mut Vm, args: &[Value]) -> Value {
    println!("{}", vm.format_value(args[0]));
    Value::Nil
}

/// Lists every registered native function's name and arity. Takes no
/// arguments itself; there's no user-defined-function introspection to
/// fall back to, since Lox functions don't carry recorded signatures.
fn native_help(vm: &mut Vm, _args: &[Value]) -> Value {
    println!("Native functions:");
    for signature in vm.native_signatures() {
        let params: Vec<&str> = signature.parameters.iter().map(|p| p.name.as_str()).collect();
        println!("  {}({})", signature.name, params.join(", "));
    }
    Value::Nil
}

fn native_list_new(vm: &mut Vm, _args: &[Value]) -> Value {
    let handle = vm.heap.alloc(Object::List(ListObj::default()));
    Value::Object(handle)
}

fn native_string_new(vm: &mut Vm, _args: &[Value]) -> Value {
    let handle = vm.heap.alloc(Object::StringBuf(StringBufObj::default()));
    Value::Object(handle)
}

fn expect_arity(method: &str, args: &[Value], expected: usize) -> Result<(), String> {
    if args.len() != expected {
        return Err(format!(
            "{method}() expects {expected} argument{}, got {}.",
            if expected == 1 { "" } else { "s" },
            args.len()
        ));
    }
    Ok(())
}

fn index_arg(method: &str, args: &[Value], position: usize, len: usize) -> Result<usize, String> {
    let n = args[position]
        .as_number()
        .ok_or_else(|| format!("{method}() expects a number index."))?;
    if n < 0.0 || n.fract() != 0.0 || n as usize >= len {
        return Err(format!("{method}() index out of bounds."));
    }
    Ok(n as usize)
}

/// Dispatches a method call on a native `List` instance. `receiver`
/// must refer to an `Object::List`.
pub fn call_list_method(
    heap: &mut Heap,
    receiver: ObjRef,
    method: &str,
    args: &[Value],
) -> Result<Value, String> {
    match method {
        "push" => {
            expect_arity("push", args, 1)?;
            if let Object::List(list) = heap.get_mut(receiver) {
                list.items.push(args[0]);
            }
            Ok(Value::Nil)
        }
        "pop" => {
            expect_arity("pop", args, 0)?;
            match heap.get_mut(receiver) {
                Object::List(list) => {
                    list.items.pop().ok_or_else(|| "pop() on an empty list.".to_string())
                }
                _ => unreachable!(),
            }
        }
        "get" => {
            expect_arity("get", args, 1)?;
            let len = match heap.get(receiver) {
                Object::List(list) => list.items.len(),
                _ => unreachable!(),
            };
            let index = index_arg("get", args, 0, len)?;
            match heap.get(receiver) {
                Object::List(list) => Ok(list.items[index]),
                _ => unreachable!(),
            }
        }
        "set" => {
            expect_arity("set", args, 2)?;
            let len = match heap.get(receiver) {
                Object::List(list) => list.items.len(),
                _ => unreachable!(),
            };
            let index = index_arg("set", args, 0, len)?;
            if let Object::List(list) = heap.get_mut(receiver) {
                list.items[index] = args[1];
            }
            Ok(Value::Nil)
        }
        "length" => {
            expect_arity("length", args, 0)?;
            match heap.get(receiver) {
                Object::List(list) => Ok(Value::Number(list.items.len() as f64)),
                _ => unreachable!(),
            }
        }
        other => Err(format!("List has no method '{other}'.")),
    }
}

/// Dispatches a method call on a native `String` instance. `receiver`
/// must refer to an `Object::StringBuf`.
pub fn call_string_method(
    heap: &mut Heap,
    receiver: ObjRef,
    method: &str,
    args: &[Value],
) -> Result<Value, String> {
    match method {
        "length" => {
            expect_arity("length", args, 0)?;
            match heap.get(receiver) {
                Object::StringBuf(buf) => Ok(Value::Number(buf.contents.chars().count() as f64)),
                _ => unreachable!(),
            }
        }
        "charAt" => {
            expect_arity("charAt", args, 1)?;
            let len = match heap.get(receiver) {
                Object::StringBuf(buf) => buf.contents.chars().count(),
                _ => unreachable!(),
            };
            let index = index_arg("charAt", args, 0, len)?;
            let ch = match heap.get(receiver) {
                Object::StringBuf(buf) => buf.contents.chars().nth(index).unwrap(),
                _ => unreachable!(),
            };
            Ok(Value::Object(heap.intern(&ch.to_string())))
        }
        "append" => {
            expect_arity("append", args, 1)?;
            let addition = as_text(heap, args[0])?;
            if let Object::StringBuf(buf) = heap.get_mut(receiver) {
                buf.contents.push_str(&addition);
            }
            Ok(Value::Nil)
        }
        "upper" => {
            expect_arity("upper", args, 0)?;
            if let Object::StringBuf(buf) = heap.get_mut(receiver) {
                buf.contents = buf.contents.to_uppercase();
            }
            Ok(Value::Nil)
        }
        "lower" => {
            expect_arity("lower", args, 0)?;
            if let Object::StringBuf(buf) = heap.get_mut(receiver) {
                buf.contents = buf.contents.to_lowercase();
            }
            Ok(Value::Nil)
        }
        other => Err(format!("String has no method '{other}'.")),
    }
}

/// Accepts either a literal (interned) string or a native `String`
/// buffer as the textual content of an argument.
fn as_text(heap: &Heap, value: Value) -> Result<String, String> {
    match value {
        Value::Object(h) => match heap.get(h) {
            Object::Str(s) => Ok(s.value.to_string()),
            Object::StringBuf(buf) => Ok(buf.contents.clone()),
            other => Err(format!("expected a string, found {}", other.kind_name())),
        },
        _ => Err("expected a string.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_push_get_and_length_round_trip() {
        let mut heap = Heap::new();
        let list = heap.alloc(Object::List(ListObj::default()));
        call_list_method(&mut heap, list, "push", &[Value::Number(1.0)]).unwrap();
        call_list_method(&mut heap, list, "push", &[Value::Number(2.0)]).unwrap();
        let len = call_list_method(&mut heap, list, "length", &[]).unwrap();
        assert_eq!(len.as_number(), Some(2.0));
        let first = call_list_method(&mut heap, list, "get", &[Value::Number(0.0)]).unwrap();
        assert_eq!(first.as_number(), Some(1.0));
    }

    #[test]
    fn list_pop_on_empty_list_is_an_error() {
        let mut heap = Heap::new();
        let list = heap.alloc(Object::List(ListObj::default()));
        assert!(call_list_method(&mut heap, list, "pop", &[]).is_err());
    }

    #[test]
    fn string_append_and_upper_mutate_in_place() {
        let mut heap = Heap::new();
        let buf = heap.alloc(Object::StringBuf(StringBufObj::default()));
        let literal = heap.intern("hi");
        call_string_method(&mut heap, buf, "append", &[Value::Object(literal)]).unwrap();
        call_string_method(&mut heap, buf, "upper", &[]).unwrap();
        match heap.get(buf) {
            Object::StringBuf(b) => assert_eq!(b.contents, "HI"),
            _ => unreachable!(),
        }
    }
}
