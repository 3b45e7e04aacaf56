/// One extraction template row. `identifier` follows the conventional
/// `vendor_os_command` slug shape, e.g. `cisco_ios_show_ip_arp`.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: i64,
    pub identifier: String,
    pub content: String,
    pub content_hash: Option<String>,
}
