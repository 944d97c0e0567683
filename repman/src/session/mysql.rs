use super::*;

use mysql_async::prelude::Queryable;

/// Driver over a `mysql_async` pool.
pub struct MysqlDriver {
    pool: mysql_async::Pool,
}

impl MysqlDriver {
    pub fn new(endpoint: &Endpoint, user: &str, password: &str) -> Self {
        let opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(endpoint.host())
            .tcp_port(endpoint.port())
            .user(Some(user))
            .pass(Some(password));
        Self {
            pool: mysql_async::Pool::new(opts),
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let opts = mysql_async::Opts::from_url(url).context("bad mysql url")?;
        Ok(Self {
            pool: mysql_async::Pool::new(opts),
        })
    }
}

#[async_trait::async_trait]
impl Driver for MysqlDriver {
    fn name(&self) -> &'static str {
        "mysql"
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = self.pool.get_conn().await.map_err(fault)?;
        Ok(Box::new(MysqlConnection { conn }))
    }
}

struct MysqlConnection {
    conn: mysql_async::Conn,
}

#[async_trait::async_trait]
impl Connection for MysqlConnection {
    async fn execute(&mut self, stmt: &str) -> Result<()> {
        self.conn.query_drop(stmt).await.map_err(fault)
    }

    async fn select(&mut self, stmt: &str) -> Result<Vec<Row>> {
        let rows: Vec<mysql_async::Row> = self.conn.query(stmt).await.map_err(fault)?;
        Ok(rows.iter().map(convert).collect())
    }
}

fn fault(e: mysql_async::Error) -> anyhow::Error {
    let x = match &e {
        mysql_async::Error::Server(se) => match se.code {
            1044 | 1045 | 1698 => Error::Auth(se.message.clone()),
            1064 | 1149 => Error::Syntax(se.message.clone()),
            code => Error::runtime(code, se.message.clone()),
        },
        _ => Error::Connection(e.to_string()),
    };
    x.into()
}

fn convert(row: &mysql_async::Row) -> Row {
    let cols = row
        .columns_ref()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let v = row.as_ref(i).and_then(render);
            (col.name_str().into_owned(), v)
        })
        .collect();
    Row::new(cols)
}

fn render(v: &mysql_async::Value) -> Option<String> {
    use mysql_async::Value;
    let s = match v {
        Value::NULL => return None,
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Int(x) => x.to_string(),
        Value::UInt(x) => x.to_string(),
        Value::Float(x) => x.to_string(),
        Value::Double(x) => x.to_string(),
        Value::Date(y, mo, d, h, mi, s, _) => {
            format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}")
        }
        Value::Time(neg, days, h, mi, s, _) => {
            let sign = if *neg { "-" } else { "" };
            let hours = days * 24 + *h as u32;
            format!("{sign}{hours:02}:{mi:02}:{s:02}")
        }
    };
    Some(s)
}
