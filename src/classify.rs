use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Coarse item type used for filtering; heuristic, not exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Laptop,
    Accessory,
    Other,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Laptop => "laptop",
            ItemType::Accessory => "accessory",
            ItemType::Other => "other",
        }
    }
}

static LAPTOP_WORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(notebook|laptop|macbook|ultrabook|chromebook)\b").unwrap()
});

static LAPTOP_MODELS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(thinkpad|latitude|xps|elitebook|spectre|pavilion|ideapad|zenbook|vivobook|aspire|swift|predator|tuf|rog|legion|lg\s*gram|macbook\s+(air|pro))\b",
    )
    .unwrap()
});

static HARDWARE_HINTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(i[3579][-\s]?\d{3,5}[a-z]{0,3}|ryzen\s?[3579]|apple\s?m[1-4]|m[1-4]|\d{1,2}\s*gb\s*ram|\d{3,4}\s*gb\s*(ssd|hdd)|\d\s*tb\s*(ssd|hdd)|windows\s?(10|11)|macos|geforce|rtx|gtx|radeon)\b",
    )
    .unwrap()
});

// Terms that, in the title, strongly indicate an accessory rather than a
// device. German and English variants.
static STRONG_ACCESSORY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(tasche|sleeve|h[üu]lle|case|cover|schutzfolie|folie|st[äa]nder|halter(ung)?|dock(ing)?|tastatur|keyboard|maus|mouse|trackpad|stift|stylus|ersatzteil(e)?)\b",
    )
    .unwrap()
});

static COMMON_ACCESSORY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(akku|battery|netzteil|ladeger[aä]t|charger|kabel|adapter|hub)\b").unwrap()
});

/// Classify a listing as laptop, accessory, or other from its text.
///
/// A hardware spec anywhere in the text wins over everything else; a strong
/// accessory term in the title wins over a laptop word.
pub fn classify_item_type(title: &str, description: &str) -> ItemType {
    let text = format!("{}\n{}", title, description);

    if HARDWARE_HINTS.is_match(&text) {
        return ItemType::Laptop;
    }
    if STRONG_ACCESSORY.is_match(title) {
        return ItemType::Accessory;
    }
    if LAPTOP_WORDS.is_match(&text) || LAPTOP_MODELS.is_match(&text) {
        return ItemType::Laptop;
    }
    if COMMON_ACCESSORY.is_match(title) {
        return ItemType::Accessory;
    }
    ItemType::Other
}

/// One extracted hardware tag: (category, normalized value).
pub type Tag = (&'static str, String);

type Render = fn(&Captures) -> String;

struct TagRule {
    pattern: &'static Lazy<Regex>,
    render: Render,
}

macro_rules! rule_regex {
    ($name:ident, $re:expr) => {
        static $name: Lazy<Regex> = Lazy::new(|| Regex::new($re).unwrap());
    };
}

rule_regex!(RE_CPU_INTEL_MODEL, r"(?i)\b(i[3579])[-\s]?(\d{4,5}[a-z]{0,2})\b");
rule_regex!(RE_CPU_INTEL_BARE, r"(?i)\b(i[3579])\b(?:[^-\s\d]|$)");
rule_regex!(RE_CPU_RYZEN, r"(?i)\b(ryzen)\s*([3579])\s*(\d{4}[a-z]{0,3})?\b");
rule_regex!(RE_CPU_APPLE, r"(?i)\b(m[1-4])\s*(pro|max|ultra)?\b");
rule_regex!(RE_RAM, r"(?i)\b(4|8|12|16|24|32|48|64)\s*gb\s*(ram|arbeitsspeicher|ddr[45])\b");
rule_regex!(RE_SSD_GB, r"(?i)\b(128|256|480|500|512|1000|1024|2000)\s*gb\s*(ssd|nvme|m\.?2|pcie)\b");
rule_regex!(RE_STORAGE_TB, r"(?i)\b([12])\s*tb\s*(ssd|nvme|hdd)?\b");
rule_regex!(RE_HDD_GB, r"(?i)\b(320|500|750|1000)\s*gb\s*hdd\b");
rule_regex!(RE_GPU_RTX, r"(?i)\b(rtx)\s*(20[6-8]0|30[5-9]0|40[5-9]0)\s*(ti|super)?\b");
rule_regex!(RE_GPU_GTX, r"(?i)\b(gtx)\s*(10[5-8]0|16[5-8]0)\s*(ti)?\b");
rule_regex!(RE_GPU_MX, r"(?i)\b(mx)\s*(150|250|330|350|450|550)\b");
rule_regex!(RE_GPU_RX, r"(?i)\b(?:radeon|rx)\s*(\d{4}[xms]?)\b");
rule_regex!(RE_SCREEN, r#"(?i)\b(10|11|12|13(?:\.3)?|14|15(?:\.6)?|16|17(?:\.3)?)\s*["']?\s*(zoll|inch|")\b"#);
rule_regex!(RE_REFRESH, r"(?i)\b(60|90|120|144|165|240|300|360)\s*hz\b");
rule_regex!(
    RE_BRAND,
    r"(?i)\b(lenovo|dell|hp|asus|acer|msi|apple|macbook|huawei|samsung|microsoft|surface|razer|medion|toshiba|fujitsu|xiaomi)\b"
);
rule_regex!(RE_OS_WINDOWS, r"(?i)\b(windows)\s*(10|11)\b");
rule_regex!(RE_OS_MAC, r"(?i)\b(macos|mac\s*os|osx)\b");
rule_regex!(RE_OS_LINUX, r"(?i)\b(linux|ubuntu|fedora|debian)\b");

fn render_intel_model(c: &Captures) -> String {
    format!("{}-{}", c[1].to_uppercase(), c[2].to_uppercase())
}

fn render_first_upper(c: &Captures) -> String {
    c[1].to_uppercase()
}

fn render_ryzen(c: &Captures) -> String {
    match c.get(3) {
        Some(m) => format!("Ryzen {} {}", &c[2], m.as_str().to_uppercase()),
        None => format!("Ryzen {}", &c[2]),
    }
}

fn render_apple_cpu(c: &Captures) -> String {
    match c.get(2) {
        Some(m) => format!("Apple {} {}", c[1].to_uppercase(), title_case(m.as_str())),
        None => format!("Apple {}", c[1].to_uppercase()),
    }
}

fn render_ram(c: &Captures) -> String {
    format!("{}GB RAM", &c[1])
}

fn render_ssd(c: &Captures) -> String {
    format!("{}GB SSD", &c[1])
}

fn render_tb(c: &Captures) -> String {
    match c.get(2) {
        Some(m) => format!("{}TB {}", &c[1], m.as_str().to_uppercase()),
        None => format!("{}TB", &c[1]),
    }
}

fn render_hdd(c: &Captures) -> String {
    format!("{}GB HDD", &c[1])
}

fn render_gpu_suffixed(c: &Captures) -> String {
    match c.get(3) {
        Some(m) => format!("{} {} {}", c[1].to_uppercase(), &c[2], m.as_str().to_uppercase()),
        None => format!("{} {}", c[1].to_uppercase(), &c[2]),
    }
}

fn render_gpu_mx(c: &Captures) -> String {
    format!("MX{}", &c[2])
}

fn render_gpu_rx(c: &Captures) -> String {
    format!("RX {}", c[1].to_uppercase())
}

fn render_screen(c: &Captures) -> String {
    format!("{}\"", &c[1])
}

fn render_refresh(c: &Captures) -> String {
    format!("{}Hz", &c[1])
}

fn render_brand(c: &Captures) -> String {
    match c[1].to_lowercase().as_str() {
        "hp" => "HP".to_string(),
        "asus" => "ASUS".to_string(),
        "msi" => "MSI".to_string(),
        "macbook" => "Apple".to_string(),
        "surface" => "Microsoft".to_string(),
        other => title_case(other),
    }
}

fn render_os_windows(c: &Captures) -> String {
    format!("Windows {}", &c[2])
}

fn render_macos(_: &Captures) -> String {
    "macOS".to_string()
}

fn render_linux(_: &Captures) -> String {
    "Linux".to_string()
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// Extract normalized hardware tags from listing text.
///
/// One tag per category except storage, which may report both an SSD and an
/// HDD. Rule order within a category is significance order; the first match
/// wins.
pub fn extract_tags(title: &str, description: &str) -> Vec<Tag> {
    let text = format!("{}\n{}", title, description);

    let categories: &[(&'static str, &[TagRule], bool)] = &[
        (
            "cpu_model",
            &[
                TagRule { pattern: &RE_CPU_INTEL_MODEL, render: render_intel_model },
                TagRule { pattern: &RE_CPU_INTEL_BARE, render: render_first_upper },
                TagRule { pattern: &RE_CPU_RYZEN, render: render_ryzen },
                TagRule { pattern: &RE_CPU_APPLE, render: render_apple_cpu },
            ],
            false,
        ),
        (
            "ram",
            &[TagRule { pattern: &RE_RAM, render: render_ram }],
            false,
        ),
        (
            "storage",
            &[
                TagRule { pattern: &RE_SSD_GB, render: render_ssd },
                TagRule { pattern: &RE_STORAGE_TB, render: render_tb },
                TagRule { pattern: &RE_HDD_GB, render: render_hdd },
            ],
            true,
        ),
        (
            "gpu",
            &[
                TagRule { pattern: &RE_GPU_RTX, render: render_gpu_suffixed },
                TagRule { pattern: &RE_GPU_GTX, render: render_gpu_suffixed },
                TagRule { pattern: &RE_GPU_MX, render: render_gpu_mx },
                TagRule { pattern: &RE_GPU_RX, render: render_gpu_rx },
            ],
            false,
        ),
        (
            "screen_size",
            &[TagRule { pattern: &RE_SCREEN, render: render_screen }],
            false,
        ),
        (
            "refresh_rate",
            &[TagRule { pattern: &RE_REFRESH, render: render_refresh }],
            false,
        ),
        (
            "brand",
            &[TagRule { pattern: &RE_BRAND, render: render_brand }],
            false,
        ),
        (
            "os",
            &[
                TagRule { pattern: &RE_OS_WINDOWS, render: render_os_windows },
                TagRule { pattern: &RE_OS_MAC, render: render_macos },
                TagRule { pattern: &RE_OS_LINUX, render: render_linux },
            ],
            false,
        ),
    ];

    let mut tags: Vec<Tag> = Vec::new();
    for &(category, rules, multi) in categories {
        for rule in rules {
            if let Some(caps) = rule.pattern.captures(&text) {
                let value = (rule.render)(&caps);
                if !tags.iter().any(|(c, v)| *c == category && *v == value) {
                    tags.push((category, value));
                }
                if !multi {
                    break;
                }
            }
        }
    }
    tags
}
