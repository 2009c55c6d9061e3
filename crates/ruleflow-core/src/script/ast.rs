#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastType {
    String,
    Int,
    Double,
    Bool,
}

impl CastType {
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "string" | "String" => Some(CastType::String),
            "int" | "long" => Some(CastType::Int),
            "double" | "float" | "decimal" => Some(CastType::Double),
            "bool" => Some(CastType::Bool),
            _ => None,
        }
    }

    /// Name the conversion is registered under in the expression engine.
    pub fn function_name(self) -> &'static str {
        match self {
            CastType::String => "CastString",
            CastType::Int => "CastInt",
            CastType::Double => "CastDouble",
            CastType::Bool => "CastBool",
        }
    }
}

/// Static functions callable as `Type.Name(...)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    IsNullOrEmpty,
    IsNullOrWhiteSpace,
    ToDouble,
    ToInt,
    ToStr,
    Round,
    Abs,
    Max,
    Min,
}

impl Builtin {
    pub fn lookup(owner: &str, name: &str) -> Option<Self> {
        match (owner, name) {
            ("string" | "String", "IsNullOrEmpty") => Some(Builtin::IsNullOrEmpty),
            ("string" | "String", "IsNullOrWhiteSpace") => Some(Builtin::IsNullOrWhiteSpace),
            ("Convert", "ToDouble" | "ToDecimal" | "ToSingle") => Some(Builtin::ToDouble),
            ("double" | "decimal" | "float", "Parse") => Some(Builtin::ToDouble),
            ("Convert", "ToInt32" | "ToInt64") => Some(Builtin::ToInt),
            ("int" | "long", "Parse") => Some(Builtin::ToInt),
            ("Convert", "ToString") => Some(Builtin::ToStr),
            ("Math", "Round") => Some(Builtin::Round),
            ("Math", "Abs") => Some(Builtin::Abs),
            ("Math", "Max") => Some(Builtin::Max),
            ("Math", "Min") => Some(Builtin::Min),
            _ => None,
        }
    }

    /// Name the function is registered under in the expression engine.
    pub fn function_name(self) -> &'static str {
        match self {
            Builtin::IsNullOrEmpty => "IsNullOrEmpty",
            Builtin::IsNullOrWhiteSpace => "IsNullOrWhiteSpace",
            Builtin::ToDouble => "ToDouble",
            Builtin::ToInt => "ToInt",
            Builtin::ToStr => "ToStr",
            Builtin::Round => "Round",
            Builtin::Abs => "Abs",
            Builtin::Max => "Max",
            Builtin::Min => "Min",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// A work-item field, by the name written in the source.
    Field(String),
    Var(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Cast(CastType, Box<Expr>),
    Call(Builtin, Vec<Expr>),
    Method {
        target: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    Property {
        target: Box<Expr>,
        name: String,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    SetField { field: String, value: Expr },
    Declare { name: String, value: Expr },
    Assign { name: String, value: Expr },
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
    Return,
}
