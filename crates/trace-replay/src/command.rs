//! Binds a wire `Command` into its typed, decoded form: every parameter's
//! declared type resolved and its value materialised against the value
//! graph.

use trace_proto::v1 as wire;

use crate::api::ApiScope;
use crate::error::ReplayError;
use crate::rt::Rt;
use crate::types::Type;
use crate::value::Value;

pub struct Parameter {
    pub name: String,
    pub ty: Type,
    pub value: Value,
}

pub struct Command {
    pub name: String,
    pub api: ApiScope,
    pub params: Vec<Parameter>,
}

impl Command {
    pub fn param(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }
}

impl std::fmt::Display for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// The `cmdName(p1=v1, p2=v2, …)` form used wherever a bound command needs
/// to show up in a log line or panic message.
impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ")")
    }
}

/// Resolves every parameter's type and decodes its value, in declaration
/// order. A command with no parameters (`StreamStart`'s initial handshake
/// notwithstanding) binds trivially.
pub async fn bind(wire_cmd: wire::Command, rt: &Rt) -> Result<Command, ReplayError> {
    let api = ApiScope::from_wire(wire_cmd.api.ok_or(ReplayError::MissingField("command.api"))?);

    let mut params = Vec::with_capacity(wire_cmd.parameters.len());
    for p in wire_cmd.parameters {
        let type_ref = p.r#type.ok_or(ReplayError::MissingField("parameter.type"))?;
        let ty = rt.get_type(type_ref.type_index, &api).await?;
        let wire_val = p.value.ok_or(ReplayError::MissingField("parameter.value"))?;
        let value = ty.decode(rt, &wire_val, None).await?;
        params.push(Parameter { name: p.name, ty, value });
    }

    Ok(Command { name: wire_cmd.name, api, params })
}
