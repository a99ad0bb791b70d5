use crate::prelude::*;

// There are two kinds of special version constraints that we don't support,
// and whose semantics are a bit unclear:
//
//  === "some string"
//  @ some_url
//
// For === the parse is easy but the semantics are murky, because we fully
// parse all versions. For @ the whole requirement changes meaning -- it
// *replaces* the version constraints -- and walking an index makes no sense
// for it anyway. Both are rejected with a parse error.

pub mod marker {
    use super::*;

    /// Lookup interface for marker variables. The environment table
    /// implements this, and so does the overlay that binds `extra`.
    pub trait Env {
        fn get_marker_var(&self, var: &str) -> Option<&str>;
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Value {
        Variable(String),
        Literal(String),
    }

    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Op {
        Compare(CompareOp),
        In,
        NotIn,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Expr {
        And(Box<Expr>, Box<Expr>),
        Or(Box<Expr>, Box<Expr>),
        Operator { op: Op, lhs: Value, rhs: Value },
    }

    impl Value {
        pub fn eval(&self, env: &dyn Env) -> Result<String> {
            match self {
                Value::Variable(varname) => env
                    .get_marker_var(varname)
                    .map(|s| s.to_owned())
                    .ok_or_else(|| eyre!("no environment marker named '{}'", varname)),
                Value::Literal(s) => Ok(s.clone()),
            }
        }
    }

    impl Expr {
        pub fn eval(&self, env: &dyn Env) -> Result<bool> {
            Ok(match self {
                Expr::And(lhs, rhs) => lhs.eval(env)? && rhs.eval(env)?,
                Expr::Or(lhs, rhs) => lhs.eval(env)? || rhs.eval(env)?,
                Expr::Operator { op, lhs, rhs } => {
                    let lhs_val = lhs.eval(env)?;
                    let rhs_val = rhs.eval(env)?;
                    match op {
                        Op::In => rhs_val.contains(&lhs_val),
                        Op::NotIn => !rhs_val.contains(&lhs_val),
                        Op::Compare(op) => {
                            // If both sides can be parsed as versions (or the RHS can
                            // be parsed as a wildcard with a wildcard-accepting op),
                            // then we do a version comparison
                            if let Ok(lhs_ver) = lhs_val.parse::<Version>() {
                                if let Ok(rhs_ranges) = op.to_ranges(&rhs_val) {
                                    return Ok(rhs_ranges
                                        .into_iter()
                                        .any(|r| r.contains(&lhs_ver)));
                                }
                            }
                            // Otherwise, we do a simple string comparison
                            use CompareOp::*;
                            match op {
                                LessThanEqual => lhs_val <= rhs_val,
                                StrictlyLessThan => lhs_val < rhs_val,
                                NotEqual => lhs_val != rhs_val,
                                Equal => lhs_val == rhs_val,
                                GreaterThanEqual => lhs_val >= rhs_val,
                                StrictlyGreaterThan => lhs_val > rhs_val,
                                Compatible => {
                                    bail!("~= requires valid version strings")
                                }
                            }
                        }
                    }
                }
            })
        }
    }

    impl Display for Op {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Op::Compare(op) => write!(f, "{}", op),
                Op::In => write!(f, "in"),
                Op::NotIn => write!(f, "not in"),
            }
        }
    }

    impl Display for Value {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Value::Variable(var) => write!(f, "{}", var),
                Value::Literal(lit) => write!(f, "\"{}\"", lit),
            }
        }
    }

    impl Display for Expr {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            fn and_operand(expr: &Expr) -> String {
                match expr {
                    // 'or' binds looser than 'and', so it needs parentheses
                    // to survive a round-trip
                    Expr::Or(..) => format!("({})", expr),
                    _ => format!("{}", expr),
                }
            }
            match self {
                Expr::And(lhs, rhs) => {
                    write!(f, "{} and {}", and_operand(lhs), and_operand(rhs))
                }
                Expr::Or(lhs, rhs) => write!(f, "{} or {}", lhs, rhs),
                Expr::Operator { op, lhs, rhs } => {
                    write!(f, "{} {} {}", lhs, op, rhs)
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParseExtra {
    Allowed,
    NotAllowed,
}

/// A single PEP 508 dependency specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: PackageName,
    pub extras: Vec<Extra>,
    pub specifiers: Specifiers,
    pub env_marker_expr: Option<marker::Expr>,
}

peg::parser! {
    grammar parser() for str {
        rule wsp()
            = quiet!{ [' ' | '\t' ] }

        rule letter_or_digit()
            = quiet!{['A'..='Z' | 'a'..='z' | '0'..='9']} / expected!("letter or digit")

        rule _()
            = quiet!{ wsp()* }

        rule version_cmp() -> &'input str
            = $("<=" / "<" / "!=" / "===" / "==" / ">=" / ">" / "~=")

        rule version()
            = (letter_or_digit() / "-" / "_" / "." / "*" / "+" / "!")+

        rule version_one() -> Specifier
            = _ op:version_cmp() _ v:$(version())
            {?
                use CompareOp::*;
                Ok(Specifier {
                    op: match op {
                        "==" => Equal,
                        "!=" => NotEqual,
                        "<=" => LessThanEqual,
                        "<" => StrictlyLessThan,
                        ">=" => GreaterThanEqual,
                        ">" => StrictlyGreaterThan,
                        "~=" => Compatible,
                        "===" => return Err("'===' is not implemented"),
                        _ => panic!("op can't be {:?}!", op)
                    },
                    value: v.into(),
                })
            }

        rule version_many() -> Specifiers
            = specs:(version_one() ++ (_ ",")) { Specifiers(specs) }

        pub rule versionspec() -> Specifiers
            = ("(" vm:version_many() ")" { vm }) / version_many()

        rule urlspec() -> Requirement
            = "@" {? Err("direct url references are not supported") }

        rule not_in() -> &'static str
            = "not" wsp()+ "in" { "not in" }

        rule marker_op() -> &'input str
            = _ op:(version_cmp() / $("in") / not_in()) { op }

        rule python_str_c() -> &'input str
            = $(quiet! { [' ' | '\t' | 'A'..='Z' | 'a'..='z' | '0'..='9' | '(' | ')'
                 | '.' | '{' | '}' | '-' | '_' | '*' | '#' | ':' | ';' | ','
                 | '/' | '?' | '[' | ']' | '!' | '~' | '`' | '@' | '$' | '%'
                 | '^' | '&' | '=' | '+' | '|' | '<' | '>'] })
              / expected!("printable character")

        // PEP 508 says that we don't have to support backslash escapes, so
        // we don't.
        rule python_squote_str() -> &'input str
            = "'" s:$((python_str_c() / "\"")*) "'" { s }

        rule python_dquote_str() -> &'input str
            = "\"" s:$((python_str_c() / "'")*) "\"" { s }

        rule python_str() -> marker::Value
            = s:(python_squote_str() / python_dquote_str())
              { marker::Value::Literal(s.to_owned()) }

        rule env_var(parse_extra: ParseExtra) -> marker::Value
            = var:$(
                "python_version" / "python_full_version" / "os_name"
                / "sys_platform" / "platform_release" / "platform_system"
                / "platform_version" / "platform_machine"
                / "platform_python_implementation" / "implementation_name"
                / "implementation_version" / "extra"
              )
              {?
               if ParseExtra::NotAllowed == parse_extra && var == "extra" {
                   return Err("'extra' marker is not valid in this context")
               }
               Ok(marker::Value::Variable(var.to_owned()))
              }

        rule marker_var(parse_extra: ParseExtra) -> marker::Value
            = _ v:(env_var(parse_extra) / python_str()) { v }

        rule marker_expr(parse_extra: ParseExtra) -> marker::Expr
            = _ "(" m:marker(parse_extra) _ ")" { m }
              / lhs:marker_var(parse_extra) op:marker_op() rhs:marker_var(parse_extra)
              {?
                  use marker::Expr::Operator;
                  use marker::Op::*;
                  use CompareOp::*;
                  Ok(match op {
                      "<=" => Operator { op: Compare(LessThanEqual), lhs, rhs },
                      "<" => Operator { op: Compare(StrictlyLessThan), lhs, rhs },
                      "!=" => Operator { op: Compare(NotEqual), lhs, rhs },
                      "==" => Operator { op: Compare(Equal), lhs, rhs },
                      ">=" => Operator { op: Compare(GreaterThanEqual), lhs, rhs },
                      ">" => Operator { op: Compare(StrictlyGreaterThan), lhs, rhs },
                      "~=" => Operator { op: Compare(Compatible), lhs, rhs },
                      "===" => return Err("'===' is not valid in markers"),
                      "in" => Operator { op: In, lhs, rhs },
                      "not in" => Operator { op: NotIn, lhs, rhs },
                      _ => panic!("op can't be {:?}!", op),
                  })
              }

        rule marker_and(parse_extra: ParseExtra) -> marker::Expr
            = lhs:marker_expr(parse_extra) _ "and" _ rhs:marker_and(parse_extra)
                 { marker::Expr::And(Box::new(lhs), Box::new(rhs)) }
              / marker_expr(parse_extra)

        rule marker_or(parse_extra: ParseExtra) -> marker::Expr
            = lhs:marker_and(parse_extra) _ "or" _ rhs:marker_or(parse_extra)
                 { marker::Expr::Or(Box::new(lhs), Box::new(rhs)) }
              / marker_and(parse_extra)

        rule marker(parse_extra: ParseExtra) -> marker::Expr
            = marker_or(parse_extra)

        rule quoted_marker(parse_extra: ParseExtra) -> marker::Expr
            = ";" _ m:marker(parse_extra) { m }

        rule identifier() -> &'input str
            = $(letter_or_digit() (letter_or_digit() / "-" / "_" / ".")*)

        rule name() -> PackageName
            = n:identifier() {? n.try_into().or(Err("error parsing package name")) }

        rule extra() -> Extra
            = e:identifier() {? e.try_into().or(Err("error parsing extra name")) }

        rule extras() -> Vec<Extra>
            = "[" _ es:(extra() ** (_ "," _)) _ "]" { es }

        rule name_req(parse_extra: ParseExtra) -> Requirement
            = name:name()
              _ extras:(extras() / "" { Vec::new() })
              _ specifiers:(versionspec() / "" { Specifiers::any() })
              _ env_marker:(quoted_marker(parse_extra)?)
              {
                  Requirement {
                      name,
                      extras,
                      specifiers,
                      env_marker_expr: env_marker,
                  }
              }

        rule url_req(parse_extra: ParseExtra) -> Requirement
            = name:name()
              _ extras:(extras() / "" { Vec::new() })
              _ url:urlspec()
              _ env_marker:((wsp() q:quoted_marker(parse_extra) { q })?)
            {
                // because urlspec() errors out unconditionally, up above
                unreachable!()
            }

        pub rule specification(parse_extra: ParseExtra) -> Requirement
            = _ r:( url_req(parse_extra) / name_req(parse_extra) ) _ { r }
    }
}

pub(crate) fn parse_versionspec(input: &str) -> Result<Specifiers> {
    Ok(parser::versionspec(input)?)
}

impl Requirement {
    pub fn parse(input: &str, parse_extra: ParseExtra) -> Result<Requirement> {
        let req = parser::specification(input, parse_extra)
            .wrap_err_with(|| format!("failed parsing requirement string {:?}", input))?;
        Ok(req)
    }

    /// The synthetic `name==version` requirement the conflict driver uses as
    /// a pin.
    pub fn pinned(name: PackageName, version: &Version) -> Requirement {
        Requirement {
            name,
            extras: Vec::new(),
            specifiers: Specifiers(vec![Specifier {
                op: CompareOp::Equal,
                value: version.to_string(),
            }]),
            env_marker_expr: None,
        }
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name.as_given())?;
        if !self.extras.is_empty() {
            let extras: Vec<&str> = self.extras.iter().map(|e| e.as_given()).collect();
            write!(f, "[{}]", extras.join(","))?;
        }
        if !self.specifiers.is_empty() {
            write!(f, "{}", self.specifiers)?;
        }
        if let Some(expr) = &self.env_marker_expr {
            write!(f, "; {}", expr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct FakeEnv(HashMap<&'static str, &'static str>);

    impl marker::Env for FakeEnv {
        fn get_marker_var(&self, var: &str) -> Option<&str> {
            self.0.get(var).copied()
        }
    }

    #[test]
    fn test_smoke() {
        let r = Requirement::parse(
            "twisted[tls] >= 20, != 20.1.*; python_version >= '3'",
            ParseExtra::Allowed,
        )
        .unwrap();
        assert_eq!(r.name.normalized(), "twisted");
        assert_eq!(r.extras.len(), 1);
        assert_eq!(r.extras[0].normalized(), "tls");
        assert_eq!(r.specifiers.to_string(), ">=20,!=20.1.*");
        assert!(r.env_marker_expr.is_some());
    }

    #[test]
    fn test_bare_name() {
        let r = Requirement::parse("requests", ParseExtra::Allowed).unwrap();
        assert_eq!(r.name.normalized(), "requests");
        assert!(r.extras.is_empty());
        assert!(r.specifiers.is_empty());
        assert!(r.env_marker_expr.is_none());
    }

    #[test]
    fn test_rejected_forms() {
        // direct url references
        assert!(Requirement::parse(
            "name @ https://example.com/name.whl",
            ParseExtra::Allowed
        )
        .is_err());
        // === comparisons
        assert!(Requirement::parse("name ===1.0", ParseExtra::Allowed).is_err());
        // 'extra' marker where it makes no sense
        assert!(
            Requirement::parse("name; extra == 'foo'", ParseExtra::NotAllowed).is_err()
        );
        assert!(
            Requirement::parse("name; extra == 'foo'", ParseExtra::Allowed).is_ok()
        );
    }

    #[test]
    fn test_marker_eval() {
        let env = FakeEnv(HashMap::from([
            ("python_version", "3.7"),
            ("sys_platform", "linux"),
            ("extra", ""),
        ]));

        for (input, expected) in [
            ("x; python_version >= '3'", true),
            ("x; python_version < '3'", false),
            // version-style comparison, not string comparison: "3.10" > "3.7"
            ("x; python_version >= '3.10'", false),
            ("x; sys_platform == 'linux' and python_version >= '3'", true),
            ("x; sys_platform == 'win32' or python_version >= '3'", true),
            ("x; sys_platform == 'win32' and python_version >= '3'", false),
            ("x; 'inux' in sys_platform", true),
            ("x; extra == 'foo'", false),
        ] {
            let r = Requirement::parse(input, ParseExtra::Allowed).unwrap();
            let got = r.env_marker_expr.unwrap().eval(&env).unwrap();
            assert_eq!(got, expected, "{input}");
        }

        // unknown variables are an error, not silently false
        let r = Requirement::parse("x; platform_release > '5'", ParseExtra::Allowed)
            .unwrap();
        assert!(r.env_marker_expr.unwrap().eval(&env).is_err());
    }

    #[test]
    fn test_requirement_display() {
        let r = Requirement::parse(
            "twisted[tls] >= 20, != 20.1.*; python_version >= '3'",
            ParseExtra::Allowed,
        )
        .unwrap();
        insta::assert_snapshot!(
            r.to_string(),
            @r###"twisted[tls]>=20,!=20.1.*; python_version >= "3""###
        );
    }

    #[test]
    fn test_marker_display_roundtrip() {
        for (input, rendered) in [
            ("x; extra == 'socks'", "extra == \"socks\""),
            (
                "x; (python_version < '3' or sys_platform == 'win32') and extra == 'dev'",
                "(python_version < \"3\" or sys_platform == \"win32\") and extra == \"dev\"",
            ),
        ] {
            let r = Requirement::parse(input, ParseExtra::Allowed).unwrap();
            assert_eq!(r.env_marker_expr.unwrap().to_string(), rendered);
        }
    }
}
