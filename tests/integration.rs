// Black-box end-to-end checks, run as subprocesses of the compiled
// binary rather than against the library API directly -- this is the
// surface an embedder actually scripts against.

use assert_cmd::Command;
use std::io::Write;
use tempfile::NamedTempFile;

fn script_file(source: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().expect("create temp script");
    f.write_all(source.as_bytes()).expect("write temp script");
    f
}

fn run(source: &str) -> assert_cmd::assert::Assert {
    let f = script_file(source);
    Command::cargo_bin("tansy").unwrap().arg(f.path()).assert()
}

#[test]
fn arithmetic_expression() {
    run("print 1+2;").success().stdout("3\n");
}

#[test]
fn for_loop_accumulates_a_string() {
    run("var s=\"\"; for (var i=0;i<3;i=i+1) s=s+i; print s;")
        .success()
        .stdout("012\n");
}

#[test]
fn single_inheritance_and_super_calls() {
    run("class A { f(){return 1;} } class B : A { f(){return super.f()+10;} } print B().f();")
        .success()
        .stdout("11\n");
}

#[test]
fn foreach_over_a_map_destructures_key_and_value_in_insertion_order() {
    run(
        "var m=[:]; m[\"a\"]=\"1\"; m[\"b\"]=\"2\"; m[\"a\"]=\"3\"; \
         foreach (k,v in m) print k+\"=\"+v;",
    )
    .success()
    .stdout("a=3\nb=2\n");
}

#[test]
fn brace_map_literal_is_an_alternate_spelling_of_the_bracket_form() {
    run(
        "var m={}; m[\"a\"]=\"1\"; m[\"b\"]=\"2\"; m[\"a\"]=\"3\"; \
         foreach (k,v in m) print k+\"=\"+v;",
    )
    .success()
    .stdout("a=3\nb=2\n");
}

#[test]
fn brace_map_literal_with_initial_pairs() {
    run("var m={\"x\":1, \"y\":2}; print m[\"x\"]+m[\"y\"];")
        .success()
        .stdout("3\n");
}

#[test]
fn closures_share_an_upvalue_across_calls() {
    run(
        "fun counter(){var n=0; fun inc(){n=n+1; return n;} return inc;} \
         var c=counter(); print c(); print c(); print c();",
    )
    .success()
    .stdout("1\n2\n3\n");
}

#[test]
fn uncaught_user_exception_is_caught_by_class() {
    run("try { throw RuntimeException(\"oops\"); } catch (Exception e) { print e.message; }")
        .success()
        .stdout("oops\n");
}

#[test]
fn a_thrown_subclass_is_caught_by_its_own_declared_catch_class() {
    run(
        "class ParseError : Exception { ParseError(msg) { this.message = msg; } } \
         fun risky() { throw ParseError(\"bad token\"); } \
         try { risky(); } catch (ParseError e) { print \"caught: \" + e.message; }",
    )
    .success()
    .stdout("caught: bad token\n");
}

#[test]
fn catching_a_sibling_subclass_does_not_swallow_an_unrelated_one() {
    run(
        "class FooError : Exception { FooError(msg) { this.message = msg; } } \
         class BarError : Exception { BarError(msg) { this.message = msg; } } \
         try { throw FooError(\"x\"); } \
         catch (BarError e) { print \"bar\"; } \
         catch (FooError e) { print \"foo: \" + e.message; }",
    )
    .success()
    .stdout("foo: x\n");
}

#[test]
fn foreach_over_an_array_needs_no_user_defined_iterator() {
    run("var total=0; foreach (x in [1,2,3]) total=total+x; print total;")
        .success()
        .stdout("6\n");
}

#[test]
fn foreach_over_a_tuple_visits_each_element() {
    run("var total=\"\"; foreach (x in (1,2,3)) total=total+x; print total;")
        .success()
        .stdout("123\n");
}

#[test]
fn instance_of_follows_the_super_chain() {
    run(
        "class A {} class B : A {} var b = B(); \
         print b is A; print b is B;",
    )
    .success()
    .stdout("true\ntrue\n");
}

#[test]
fn string_interning_makes_equal_literals_equal() {
    run("var a = \"hi\"; var b = \"h\" + \"i\"; print a == b;")
        .success()
        .stdout("true\n");
}

#[test]
fn map_mutation_during_iteration_is_rejected() {
    run(
        "var m=[:]; m[\"a\"]=1; m[\"b\"]=2; \
         foreach (k,v in m) { m[\"c\"]=3; }",
    )
    .failure()
    .code(70);
}

#[test]
fn sibling_closures_over_the_same_function_share_upvalues() {
    run(
        "fun make(){ var n=10; fun get(){return n;} fun set(v){n=v;} return (get,set); } \
         var (get,set)=make(); set(42); print get();",
    )
    .success()
    .stdout("42\n");
}

#[test]
fn syntax_errors_exit_with_code_65() {
    run("var x = ;").failure().code(65);
}

#[test]
fn missing_script_argument_prints_usage_and_exits_64() {
    Command::cargo_bin("tansy")
        .unwrap()
        .arg("one")
        .arg("two")
        .assert()
        .failure()
        .code(64);
}

#[test]
fn unreadable_path_exits_with_code_64() {
    Command::cargo_bin("tansy")
        .unwrap()
        .arg("/nonexistent/path/to/a/script.tansy")
        .assert()
        .failure()
        .code(64);
}
