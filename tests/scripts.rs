// Integration tests for the uGO execution core.
//
// These tests compile and run complete uGO scripts and check the results.
// Coverage:
// - Operators, destructuring, and multi-value returns
// - Functions, closures, recursion, and tail calls
// - try/catch/finally in all exit modes
// - Iteration, slicing, and builtin conversions
// - Modules, globals, and host embedding surfaces

use std::sync::Arc;
use ugo::compiler::{compile, CompilerOptions};
use ugo::errors::ErrorKind;
use ugo::module::ModuleMap;
use ugo::value::Value;
use ugo::vm::Vm;

fn run_script(source: &str) -> Value {
    run_with_options(source, CompilerOptions::default())
}

fn run_with_options(source: &str, options: CompilerOptions) -> Value {
    let bytecode = compile(source.as_bytes(), options).expect("compile failed");
    let mut vm = Vm::new(Arc::new(bytecode));
    vm.run(Value::empty_map(), &[]).expect("run failed")
}

fn run_script_err(source: &str) -> ugo::errors::RuntimeError {
    let bytecode =
        compile(source.as_bytes(), CompilerOptions::default()).expect("compile failed");
    let mut vm = Vm::new(Arc::new(bytecode));
    vm.run(Value::empty_map(), &[]).expect_err("expected runtime error")
}

fn ints(values: &[i64]) -> Value {
    Value::array(values.iter().map(|v| Value::Int(*v)).collect())
}

#[test]
fn test_operator_precedence() {
    assert_eq!(run_script("return 2 + 3 * 4"), Value::Int(14));
}

#[test]
fn test_destructuring_define() {
    assert_eq!(run_script("x, y := [1, 2, 3]; return x, y"), ints(&[1, 2]));
    // Missing elements become undefined.
    assert_eq!(
        run_script("x, y := [1]; return [x, isUndefined(y)]"),
        Value::array(vec![Value::Int(1), Value::Bool(true)])
    );
    // A non-array RHS binds the first target.
    assert_eq!(
        run_script("x, y := 7; return [x, isUndefined(y)]"),
        Value::array(vec![Value::Int(7), Value::Bool(true)])
    );
}

#[test]
fn test_recursive_closure() {
    let source = r#"
        f := func(n) {
            if n < 2 { return n }
            return f(n-1) + f(n-2)
        }
        return f(10)
    "#;
    assert_eq!(run_script(source), Value::Int(55));
}

#[test]
fn test_catch_binds_error_value() {
    let source = r#"
        try {
            1/0
        } catch err {
            return typeName(err)
        } finally { }
    "#;
    assert_eq!(run_script(source), Value::string("error"));
}

#[test]
fn test_const_iota() {
    assert_eq!(
        run_script("const (a = iota, b, c); return a, b, c"),
        ints(&[0, 1, 2])
    );
    assert_eq!(
        run_script("const (a = iota * 2, b, c); return a, b, c"),
        ints(&[0, 2, 4])
    );
    // A user binding named iota shadows the implicit one.
    assert_eq!(
        run_script("iota := 9; const x = iota; return x"),
        Value::Int(9)
    );
}

#[test]
fn test_map_fill_loop() {
    let source = r#"
        m := {}
        for i := 0; i < 3; i++ {
            m[string(i)] = i*i
        }
        return m["2"]
    "#;
    assert_eq!(run_script(source), Value::Int(4));
}

#[test]
fn test_determinism() {
    let source = r#"
        acc := 0
        for i := 0; i < 100; i++ {
            acc = acc*31 + i
        }
        return acc
    "#;
    let first = run_script(source);
    for _ in 0..3 {
        assert_eq!(run_script(source), first);
    }
}

#[test]
fn test_slice_undefined_endpoints() {
    assert_eq!(
        run_script("a := [1, 2, 3]; return a[undefined:undefined]"),
        ints(&[1, 2, 3])
    );
    assert_eq!(run_script("a := [1, 2, 3]; return a[:2]"), ints(&[1, 2]));
    assert_eq!(run_script("a := [1, 2, 3]; return a[1:]"), ints(&[2, 3]));
}

#[test]
fn test_zero_division_detectable() {
    let source = r#"
        try {
            1/0
        } catch err {
            return isError(err, ZeroDivisionError)
        }
    "#;
    assert_eq!(run_script(source), Value::Bool(true));
    let err = run_script_err("return 1 % 0");
    assert_eq!(err.kind, ErrorKind::ZeroDivisionError);
}

#[test]
fn test_variadic_zero_surplus_is_empty_array() {
    let source = r#"
        f := func(a, ...rest) { return [isArray(rest), len(rest)] }
        return f(1)
    "#;
    assert_eq!(
        run_script(source),
        Value::array(vec![Value::Bool(true), Value::Int(0)])
    );
}

#[test]
fn test_call_expansion() {
    let source = r#"
        sum := func(...xs) {
            total := 0
            for _, x in xs { total += x }
            return total
        }
        args := [1, 2, 3]
        return sum(10, args...)
    "#;
    assert_eq!(run_script(source), Value::Int(16));
}

#[test]
fn test_multi_value_return_round_trip() {
    let source = r#"
        divmod := func(a, b) { return a / b, a % b }
        q, r := divmod(17, 5)
        return [q, r]
    "#;
    assert_eq!(run_script(source), ints(&[3, 2]));
}

#[test]
fn test_closures_capture_one_cell() {
    let source = r#"
        make := func() {
            n := 0
            inc := func() { n = n + 1 }
            get := func() { return n }
            return [inc, get]
        }
        pair := make()
        inc := pair[0]
        get := pair[1]
        inc()
        inc()
        return get()
    "#;
    assert_eq!(run_script(source), Value::Int(2));
}

#[test]
fn test_tail_call_bounded_frames() {
    let source = r#"
        count := func(n, acc) {
            if n == 0 { return acc }
            return count(n - 1, acc + 1)
        }
        return count(50000, 0)
    "#;
    assert_eq!(run_script(source), Value::Int(50000));
}

#[test]
fn test_finally_runs_exactly_once_per_entry() {
    let source = r#"
        global runs
        runs = 0
        f := func(mode) {
            try {
                if mode == "throw" { throw "x" }
                if mode == "return" { return 1 }
            } catch err {
            } finally {
                runs = runs + 1
            }
            return 0
        }
        f("fall")
        f("throw")
        f("return")
        return runs
    "#;
    assert_eq!(run_script(source), Value::Int(3));
}

#[test]
fn test_nested_finally_ordering_on_return() {
    let source = r#"
        global trace
        trace = []
        f := func() {
            try {
                try {
                    return "v"
                } finally {
                    trace = append(trace, "inner")
                }
            } finally {
                trace = append(trace, "outer")
            }
        }
        result := f()
        return append(trace, result)
    "#;
    assert_eq!(
        run_script(source),
        Value::array(vec![
            Value::string("inner"),
            Value::string("outer"),
            Value::string("v"),
        ])
    );
}

#[test]
fn test_rethrow_after_finally() {
    let source = r#"
        log := []
        try {
            try {
                throw "inner boom"
            } finally {
                log = append(log, "finally")
            }
        } catch err {
            log = append(log, err.Message)
        }
        return log
    "#;
    assert_eq!(
        run_script(source),
        Value::array(vec![Value::string("finally"), Value::string("inner boom")])
    );
}

#[test]
fn test_error_cause_chain_via_throw() {
    let source = r#"
        try {
            try {
                1/0
            } catch err {
                throw err
            }
        } catch outer {
            return isError(outer, ZeroDivisionError)
        }
    "#;
    assert_eq!(run_script(source), Value::Bool(true));
}

#[test]
fn test_for_in_over_string_and_bytes() {
    assert_eq!(
        run_script(r#"n := 0; for i, c in "abc" { n += i + int(c) }; return n"#),
        Value::Int(0 + 1 + 2 + 97 + 98 + 99)
    );
    assert_eq!(
        run_script(r#"n := 0; for _, b in bytes("ab") { n += b }; return n"#),
        Value::Int(97 + 98)
    );
}

#[test]
fn test_string_indexing_and_concat() {
    assert_eq!(run_script(r#"s := "abc"; return s[1]"#), Value::Int(98));
    assert_eq!(
        run_script(r#"return "n=" + 42 + ", ok=" + true"#),
        Value::string("n=42, ok=true")
    );
}

#[test]
fn test_uint_and_char_arithmetic() {
    assert_eq!(run_script("return 10u - 11u + 1u"), Value::Uint(0));
    assert_eq!(run_script("return 'a' + 1"), Value::Char('b'));
    assert_eq!(run_script("return 'b' - 'a'"), Value::Int(1));
}

#[test]
fn test_float_semantics() {
    assert_eq!(run_script("return 1 / 2.0"), Value::Float(0.5));
    // Only NaN is falsy for floats.
    assert_eq!(run_script("if 0.0 { return 1 }; return 2"), Value::Int(1));
    assert_eq!(
        run_script("nan := 0.0 / 0.0; if nan { return 1 }; return 2"),
        Value::Int(2)
    );
}

#[test]
fn test_compound_assignment_and_incdec() {
    let source = r#"
        x := 10
        x += 5
        x *= 2
        x -= 6
        x /= 4
        x++
        x--
        x--
        return x
    "#;
    assert_eq!(run_script(source), Value::Int(5));
}

#[test]
fn test_selector_assignment_chain() {
    let source = r#"
        m := {inner: {list: [0, 0, 0]}}
        m.inner.list[1] = 42
        m.inner.count = 3
        return [m.inner.list[1], m.inner.count]
    "#;
    assert_eq!(run_script(source), ints(&[42, 3]));
}

#[test]
fn test_ternary_and_short_circuit() {
    assert_eq!(run_script("x := 5; return x > 3 ? \"big\" : \"small\""), Value::string("big"));
    assert_eq!(run_script("return undefined || \"fallback\""), Value::string("fallback"));
    assert_eq!(run_script("return undefined && boom"), Value::Undefined);
}

#[test]
fn test_imports_cached_per_vm() {
    let mut modules = ModuleMap::new();
    modules.add_source(
        "mathx",
        r#"
            square := func(n) { return n * n }
            return {square: square, answer: 42}
        "#,
    );
    let source = r#"
        mathx := import("mathx")
        again := import("mathx")
        return [mathx.square(6), mathx.answer, again.answer]
    "#;
    let result = run_with_options(
        source,
        CompilerOptions { module_map: Some(modules), ..Default::default() },
    );
    assert_eq!(result, ints(&[36, 42, 42]));
}

#[test]
fn test_builtin_module_import() {
    let mut modules = ModuleMap::new();
    let exports = Value::empty_map();
    exports.index_set(&Value::string("pi"), Value::Float(3.25)).unwrap();
    modules.add_value("consts", exports);
    let source = r#"
        consts := import("consts")
        return [consts.pi, consts.__module_name__]
    "#;
    let result = run_with_options(
        source,
        CompilerOptions { module_map: Some(modules), ..Default::default() },
    );
    assert_eq!(
        result,
        Value::array(vec![Value::Float(3.25), Value::string("consts")])
    );
}

#[test]
fn test_nested_module_imports() {
    let mut modules = ModuleMap::new();
    modules.add_source("a", r#"b := import("b"); return {n: b.n + 1}"#);
    modules.add_source("b", "return {n: 1}");
    let source = r#"a := import("a"); return a.n"#;
    let result = run_with_options(
        source,
        CompilerOptions { module_map: Some(modules), ..Default::default() },
    );
    assert_eq!(result, Value::Int(2));
}

#[test]
fn test_script_params() {
    let bytecode = compile(
        "param (a, ...rest); return [a, len(rest)]".as_bytes(),
        CompilerOptions::default(),
    )
    .unwrap();
    let mut vm = Vm::new(Arc::new(bytecode));
    let result = vm
        .run(Value::empty_map(), &[Value::Int(1), Value::Int(2), Value::Int(3)])
        .unwrap();
    assert_eq!(result, ints(&[1, 2]));
}

#[test]
fn test_var_and_global_declarations() {
    let source = r#"
        var (a, b = 2, c)
        global g
        g = 7
        return [isUndefined(a), b, isUndefined(c), g]
    "#;
    assert_eq!(
        run_script(source),
        Value::array(vec![
            Value::Bool(true),
            Value::Int(2),
            Value::Bool(true),
            Value::Int(7),
        ])
    );
}

#[test]
fn test_builtin_conversions_and_predicates() {
    assert_eq!(run_script(r#"return int("42") + 1"#), Value::Int(43));
    assert_eq!(run_script("return string('x')"), Value::string("x"));
    assert_eq!(run_script("return uint(7)"), Value::Uint(7));
    assert_eq!(run_script("return float(1) / 2"), Value::Float(0.5));
    assert_eq!(run_script("return bool([])"), Value::Bool(false));
    assert_eq!(
        run_script("return [isInt(1), isString(1), isIterable([]), isCallable(len)]"),
        Value::array(vec![
            Value::Bool(true),
            Value::Bool(false),
            Value::Bool(true),
            Value::Bool(true),
        ])
    );
}

#[test]
fn test_sprintf() {
    assert_eq!(
        run_script(r#"return sprintf("%v-%d", "a", 7)"#),
        Value::string("a-7")
    );
}

#[test]
fn test_runtime_error_kinds() {
    assert_eq!(run_script_err("return [1][2]").kind, ErrorKind::IndexOutOfBounds);
    assert_eq!(run_script_err("x := 1; return x()").kind, ErrorKind::NotCallable);
    assert_eq!(run_script_err("for v in 1 { }").kind, ErrorKind::NotIterable);
    assert_eq!(run_script_err("return 1 + {}").kind, ErrorKind::InvalidOperator);
    assert_eq!(run_script_err("return {}[0]()").kind, ErrorKind::NotCallable);
}

#[test]
fn test_error_fields() {
    let source = r#"
        try {
            throw "kaboom"
        } catch err {
            return [err.Name, err.Message]
        }
    "#;
    assert_eq!(
        run_script(source),
        Value::array(vec![Value::string("error"), Value::string("kaboom")])
    );
}

#[test]
fn test_shadowed_builtin_wins() {
    let source = r#"
        len := func(x) { return 99 }
        return len([1, 2, 3])
    "#;
    assert_eq!(run_script(source), Value::Int(99));
}

#[test]
fn test_block_scoping() {
    let source = r#"
        x := 1
        {
            x := 2
            x = x + 1
        }
        return x
    "#;
    assert_eq!(run_script(source), Value::Int(1));
}

#[test]
fn test_captured_block_local_survives() {
    let source = r#"
        get := undefined
        {
            hidden := 41
            get = func() { return hidden + 1 }
        }
        {
            clobber := 0
            clobber = clobber + 1
        }
        return get()
    "#;
    assert_eq!(run_script(source), Value::Int(42));
}
