//! Class reports for `huella inspect`

use std::fmt;

use serde::Serialize;

use crate::classfile::{ClassFile, Result};
use crate::instrument::{classify, MethodStatus};
use crate::marker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodReport {
    pub name: String,
    pub descriptor: String,
    pub status: MethodStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassReport {
    pub name: String,
    pub major_version: u16,
    pub minor_version: u16,
    pub interface: bool,
    /// Already carries the flag or notify routine
    pub instrumented: bool,
    pub methods: Vec<MethodReport>,
}

impl ClassReport {
    pub fn trackable(&self) -> usize {
        self.methods
            .iter()
            .filter(|m| m.status == MethodStatus::Trackable)
            .count()
    }
}

pub fn inspect(bytes: &[u8]) -> Result<ClassReport> {
    let class = ClassFile::parse(bytes)?;
    let cp = &class.constant_pool;
    let methods = class
        .methods
        .iter()
        .map(|method| {
            Ok(MethodReport {
                name: method.name(cp)?,
                descriptor: method.descriptor(cp)?,
                status: classify(&class, method)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ClassReport {
        name: class.binary_name()?,
        major_version: class.major_version,
        minor_version: class.minor_version,
        interface: class.is_interface(),
        instrumented: marker::is_instrumented(&class),
        methods,
    })
}

impl fmt::Display for ClassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "class {}", self.name)?;
        writeln!(f, "  version:      {}.{}", self.major_version, self.minor_version)?;
        writeln!(f, "  interface:    {}", self.interface)?;
        writeln!(f, "  instrumented: {}", self.instrumented)?;
        writeln!(
            f,
            "  methods:      {} ({} trackable)",
            self.methods.len(),
            self.trackable()
        )?;
        for method in &self.methods {
            let status = match method.status {
                MethodStatus::Trackable => "trackable",
                MethodStatus::Initializer => "initializer",
                MethodStatus::NoBody => "no body",
                MethodStatus::Excluded => "excluded",
            };
            writeln!(f, "    {:<12} {}{}", status, method.name, method.descriptor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::opcodes::RETURN;
    use crate::classfile::{access, Code, Instruction};

    fn bytes() -> Vec<u8> {
        let mut class =
            ClassFile::new("app/Foo", "java/lang/Object", access::PUBLIC, 52).unwrap();
        let ret = Code::new(0, 1, vec![Instruction::Simple(RETURN)]);
        class
            .add_method(access::PUBLIC, "<init>", "()V", Some(&ret))
            .unwrap();
        class.add_method(access::PUBLIC, "run", "()V", Some(&ret)).unwrap();
        class
            .add_method(access::PUBLIC | access::ABSTRACT, "todo", "()I", None)
            .unwrap();
        class.to_bytes().unwrap()
    }

    #[test]
    fn test_report_classifies_methods() {
        let report = inspect(&bytes()).unwrap();
        assert_eq!(report.name, "app.Foo");
        assert_eq!(report.major_version, 52);
        assert!(!report.instrumented);
        let statuses: Vec<_> = report.methods.iter().map(|m| m.status).collect();
        assert_eq!(
            statuses,
            vec![
                MethodStatus::Initializer,
                MethodStatus::Trackable,
                MethodStatus::NoBody
            ]
        );
        assert_eq!(report.trackable(), 1);
    }

    #[test]
    fn test_report_after_rewrite() {
        let rewritten = crate::instrument::Instrumenter::default()
            .transform(&bytes())
            .unwrap();
        let report = inspect(&rewritten).unwrap();
        assert!(report.instrumented);
        assert!(report
            .methods
            .iter()
            .any(|m| m.name == marker::NOTIFY_METHOD));
    }

    #[test]
    fn test_text_and_json_forms() {
        let report = inspect(&bytes()).unwrap();
        let text = report.to_string();
        assert!(text.contains("class app.Foo"));
        assert!(text.contains("trackable    run()V"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["name"], "app.Foo");
        assert_eq!(json["methods"][1]["status"], "trackable");
        assert_eq!(json["methods"][2]["status"], "no-body");
    }
}
