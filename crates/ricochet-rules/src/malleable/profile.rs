//! Malleable C2 profile parsing.
//!
//! Parses the subset of the profile DSL that HTTP verification needs:
//! global `set` options, `http-config`, `http-get`/`http-post` blocks with
//! their `client` sections and data transforms, and `http-stager`. Blocks
//! the matcher does not consume (`stage`, `process-inject`, server sections,
//! ...) are skipped structurally.

use crate::error::RuleError;
use crate::malleable::transform::Transform;

#[derive(Debug, Clone, Default)]
pub struct HttpConfig {
    pub block_useragents: Vec<String>,
    pub allow_useragents: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientBlock {
    pub headers: Vec<(String, String)>,
    pub parameters: Vec<(String, String)>,
    pub metadata: Vec<Transform>,
    pub id: Vec<Transform>,
    pub output: Vec<Transform>,
}

/// An `http-get` or `http-post` block.
#[derive(Debug, Clone, Default)]
pub struct HttpBlock {
    pub name: Option<String>,
    pub verb: Option<String>,
    pub uris: Vec<String>,
    pub client: ClientBlock,
}

/// An `http-stager` block.
#[derive(Debug, Clone, Default)]
pub struct StagerBlock {
    pub name: Option<String>,
    pub uri_x86: Vec<String>,
    pub uri_x64: Vec<String>,
    pub client: ClientBlock,
}

#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub user_agent: Option<String>,
    pub host_stage: bool,
    pub http_config: HttpConfig,
    pub http_get: Vec<HttpBlock>,
    pub http_post: Vec<HttpBlock>,
    pub http_stager: Vec<StagerBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Str(String),
    LBrace,
    RBrace,
    Semi,
}

fn tokenize(src: &str) -> Result<Vec<Token>, RuleError> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            ';' => {
                chars.next();
                tokens.push(Token::Semi);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('r') => value.push('\r'),
                            Some('t') => value.push('\t'),
                            Some(other) => value.push(other),
                            None => {
                                return Err(RuleError::Profile(
                                    "unterminated string".into(),
                                ))
                            }
                        },
                        Some(other) => value.push(other),
                        None => {
                            return Err(RuleError::Profile("unterminated string".into()))
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "{};\"#".contains(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_str(&mut self, what: &str) -> Result<String, RuleError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(s),
            other => Err(RuleError::Profile(format!(
                "expected string for {what}, got {other:?}"
            ))),
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), RuleError> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(RuleError::Profile(format!(
                "expected {token:?}, got {other:?}"
            ))),
        }
    }

    /// Consume an optional block variant name.
    fn variant(&mut self) -> Option<String> {
        if let Some(Token::Str(_)) = self.peek() {
            match self.next() {
                Some(Token::Str(s)) => Some(s),
                _ => unreachable!("peeked a string"),
            }
        } else {
            None
        }
    }

    /// Skip a balanced `{ ... }` block; the opening brace is next.
    fn skip_block(&mut self) -> Result<(), RuleError> {
        self.expect(Token::LBrace)?;
        let mut depth = 1usize;
        while depth > 0 {
            match self.next() {
                Some(Token::LBrace) => depth += 1,
                Some(Token::RBrace) => depth -= 1,
                Some(_) => {}
                None => return Err(RuleError::Profile("unbalanced block".into())),
            }
        }
        Ok(())
    }

    /// Skip the rest of a `word ... ;` statement.
    fn skip_statement(&mut self) -> Result<(), RuleError> {
        loop {
            match self.next() {
                Some(Token::Semi) => return Ok(()),
                Some(Token::LBrace) => {
                    // a block after all: unwind it instead
                    self.pos -= 1;
                    return self.skip_block();
                }
                Some(_) => {}
                None => return Err(RuleError::Profile("unterminated statement".into())),
            }
        }
    }

    fn parse_set(&mut self) -> Result<(String, String), RuleError> {
        let name = match self.next() {
            Some(Token::Word(w)) => w,
            other => {
                return Err(RuleError::Profile(format!(
                    "expected option name, got {other:?}"
                )))
            }
        };
        let value = self.expect_str(&name)?;
        self.expect(Token::Semi)?;
        Ok((name, value))
    }

    fn parse_transforms(&mut self) -> Result<Vec<Transform>, RuleError> {
        self.expect(Token::LBrace)?;
        let mut transforms = Vec::new();
        loop {
            match self.next() {
                Some(Token::RBrace) => break,
                Some(Token::Word(func)) => {
                    let mut args = Vec::new();
                    loop {
                        match self.next() {
                            Some(Token::Str(arg)) => args.push(arg),
                            Some(Token::Semi) => break,
                            other => {
                                return Err(RuleError::Profile(format!(
                                    "bad transform argument: {other:?}"
                                )))
                            }
                        }
                    }
                    transforms.push(Transform::new(func, args));
                }
                other => {
                    return Err(RuleError::Profile(format!(
                        "bad transform statement: {other:?}"
                    )))
                }
            }
        }
        Ok(transforms)
    }

    fn parse_client(&mut self) -> Result<ClientBlock, RuleError> {
        self.expect(Token::LBrace)?;
        let mut client = ClientBlock::default();
        loop {
            match self.next() {
                Some(Token::RBrace) => break,
                Some(Token::Word(word)) => match word.as_str() {
                    "header" => {
                        let name = self.expect_str("header name")?;
                        let value = self.expect_str("header value")?;
                        self.expect(Token::Semi)?;
                        client.headers.push((name, value));
                    }
                    "parameter" => {
                        let name = self.expect_str("parameter name")?;
                        let value = self.expect_str("parameter value")?;
                        self.expect(Token::Semi)?;
                        client.parameters.push((name, value));
                    }
                    "metadata" => client.metadata = self.parse_transforms()?,
                    "id" => client.id = self.parse_transforms()?,
                    "output" => client.output = self.parse_transforms()?,
                    _ => self.skip_statement()?,
                },
                other => {
                    return Err(RuleError::Profile(format!(
                        "bad client statement: {other:?}"
                    )))
                }
            }
        }
        Ok(client)
    }

    fn parse_http_block(&mut self, name: Option<String>) -> Result<HttpBlock, RuleError> {
        self.expect(Token::LBrace)?;
        let mut block = HttpBlock {
            name,
            ..Default::default()
        };
        loop {
            match self.next() {
                Some(Token::RBrace) => break,
                Some(Token::Word(word)) => match word.as_str() {
                    "set" => {
                        let (option, value) = self.parse_set()?;
                        match option.as_str() {
                            "uri" => {
                                block.uris =
                                    value.split_whitespace().map(str::to_string).collect();
                            }
                            "verb" if !value.is_empty() => block.verb = Some(value),
                            _ => {}
                        }
                    }
                    "client" => block.client = self.parse_client()?,
                    _ => {
                        // server section or an option we don't verify
                        self.variant();
                        match self.peek() {
                            Some(Token::LBrace) => self.skip_block()?,
                            _ => self.skip_statement()?,
                        }
                    }
                },
                other => {
                    return Err(RuleError::Profile(format!(
                        "bad http block statement: {other:?}"
                    )))
                }
            }
        }
        Ok(block)
    }

    fn parse_stager_block(&mut self, name: Option<String>) -> Result<StagerBlock, RuleError> {
        self.expect(Token::LBrace)?;
        let mut block = StagerBlock {
            name,
            ..Default::default()
        };
        loop {
            match self.next() {
                Some(Token::RBrace) => break,
                Some(Token::Word(word)) => match word.as_str() {
                    "set" => {
                        let (option, value) = self.parse_set()?;
                        match option.as_str() {
                            "uri_x86" => {
                                block.uri_x86 =
                                    value.split_whitespace().map(str::to_string).collect();
                            }
                            "uri_x64" => {
                                block.uri_x64 =
                                    value.split_whitespace().map(str::to_string).collect();
                            }
                            _ => {}
                        }
                    }
                    "client" => block.client = self.parse_client()?,
                    _ => {
                        self.variant();
                        match self.peek() {
                            Some(Token::LBrace) => self.skip_block()?,
                            _ => self.skip_statement()?,
                        }
                    }
                },
                other => {
                    return Err(RuleError::Profile(format!(
                        "bad stager statement: {other:?}"
                    )))
                }
            }
        }
        Ok(block)
    }

    fn parse_http_config(&mut self, config: &mut HttpConfig) -> Result<(), RuleError> {
        self.expect(Token::LBrace)?;
        loop {
            match self.next() {
                Some(Token::RBrace) => return Ok(()),
                Some(Token::Word(word)) => match word.as_str() {
                    "set" => {
                        let (option, value) = self.parse_set()?;
                        let split = |v: &str| {
                            v.split(',')
                                .map(str::trim)
                                .filter(|s| !s.is_empty())
                                .map(str::to_string)
                                .collect()
                        };
                        match option.as_str() {
                            "block_useragents" => config.block_useragents = split(&value),
                            "allow_useragents" => config.allow_useragents = split(&value),
                            _ => {}
                        }
                    }
                    _ => self.skip_statement()?,
                },
                other => {
                    return Err(RuleError::Profile(format!(
                        "bad http-config statement: {other:?}"
                    )))
                }
            }
        }
    }
}

impl Profile {
    pub fn parse(src: &str) -> Result<Self, RuleError> {
        let mut parser = Parser {
            tokens: tokenize(src)?,
            pos: 0,
        };
        let mut profile = Profile {
            host_stage: true,
            ..Default::default()
        };

        while let Some(token) = parser.next() {
            match token {
                Token::Word(word) => match word.as_str() {
                    "set" => {
                        let (option, value) = parser.parse_set()?;
                        match option.as_str() {
                            "useragent" if !value.is_empty() => {
                                profile.user_agent = Some(value);
                            }
                            "host_stage" => profile.host_stage = value == "true",
                            _ => {}
                        }
                    }
                    "http-get" => {
                        let name = parser.variant();
                        profile.http_get.push(parser.parse_http_block(name)?);
                    }
                    "http-post" => {
                        let name = parser.variant();
                        profile.http_post.push(parser.parse_http_block(name)?);
                    }
                    "http-stager" => {
                        let name = parser.variant();
                        profile.http_stager.push(parser.parse_stager_block(name)?);
                    }
                    "http-config" => parser.parse_http_config(&mut profile.http_config)?,
                    _ => {
                        parser.variant();
                        match parser.peek() {
                            Some(Token::LBrace) => parser.skip_block()?,
                            _ => parser.skip_statement()?,
                        }
                    }
                },
                other => {
                    return Err(RuleError::Profile(format!(
                        "unexpected top-level token: {other:?}"
                    )))
                }
            }
        }

        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
# sample profile
set sleeptime "5000";
set useragent "Mozilla/5.0 (Windows NT 10.0; Trident/7.0; rv:11.0) like Gecko";
set host_stage "false";

http-config {
    set block_useragents "curl*,lynx*,wget*";
    header "Server" "nginx";
}

http-get "variant-a" {
    set uri "/api/v1/event /cdn/assets";

    client {
        header "Accept" "*/*";
        parameter "id" "x";

        metadata {
            base64url;
            prepend "session=";
            header "Cookie";
        }
    }

    server {
        output {
            netbios;
            print;
        }
    }
}

http-post {
    set uri "/api/v1/submit";
    set verb "POST";

    client {
        id {
            parameter "sid";
        }
        output {
            mask;
            base64;
            print;
        }
    }
}

http-stager {
    set uri_x86 "/cdn/x86";
    set uri_x64 "/cdn/x64";

    client {
        header "Accept-Language" "en-US";
    }
}

stage {
    set userwx "false";
}
"#;

    #[test]
    fn parses_globals_and_config() {
        let p = Profile::parse(PROFILE).unwrap();
        assert_eq!(
            p.user_agent.as_deref(),
            Some("Mozilla/5.0 (Windows NT 10.0; Trident/7.0; rv:11.0) like Gecko")
        );
        assert!(!p.host_stage);
        assert_eq!(p.http_config.block_useragents, ["curl*", "lynx*", "wget*"]);
        assert!(p.http_config.allow_useragents.is_empty());
    }

    #[test]
    fn parses_http_get_block() {
        let p = Profile::parse(PROFILE).unwrap();
        assert_eq!(p.http_get.len(), 1);
        let get = &p.http_get[0];
        assert_eq!(get.name.as_deref(), Some("variant-a"));
        assert_eq!(get.uris, ["/api/v1/event", "/cdn/assets"]);
        assert_eq!(get.verb, None);
        assert_eq!(get.client.headers, [("Accept".into(), "*/*".into())]);
        assert_eq!(get.client.parameters, [("id".into(), "x".into())]);
        let metadata: Vec<&str> = get.client.metadata.iter().map(|t| t.func.as_str()).collect();
        assert_eq!(metadata, ["base64url", "prepend", "header"]);
        assert_eq!(get.client.metadata[2].args, ["Cookie"]);
    }

    #[test]
    fn parses_http_post_and_stager() {
        let p = Profile::parse(PROFILE).unwrap();
        let post = &p.http_post[0];
        assert_eq!(post.verb.as_deref(), Some("POST"));
        assert_eq!(post.client.id.last().unwrap().func, "parameter");
        assert_eq!(post.client.output.len(), 3);

        let stager = &p.http_stager[0];
        assert_eq!(stager.uri_x86, ["/cdn/x86"]);
        assert_eq!(stager.uri_x64, ["/cdn/x64"]);
    }

    #[test]
    fn skips_unknown_blocks() {
        // the stage block and server section must not break parsing
        let p = Profile::parse(PROFILE).unwrap();
        assert_eq!(p.http_post.len(), 1);
    }

    #[test]
    fn host_stage_defaults_true() {
        let p = Profile::parse("set sleeptime \"1\";").unwrap();
        assert!(p.host_stage);
    }

    #[test]
    fn string_escapes() {
        let p = Profile::parse(r#"set useragent "a\"b\\c";"#).unwrap();
        assert_eq!(p.user_agent.as_deref(), Some("a\"b\\c"));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(Profile::parse("set useragent \"oops;").is_err());
    }
}
