//! Cardinal number spelling for 1..=2099, enough for counts and years in
//! narration text.

use crate::lang::Language;

pub const MAX_SPELLED: u32 = 2099;

pub fn spell_cardinal(n: u32, lang: Language) -> Option<String> {
    if n == 0 || n > MAX_SPELLED {
        return None;
    }
    Some(match lang {
        Language::Cs => cs(n),
        Language::En => en(n),
        Language::De => de(n),
        Language::Es => es(n),
        Language::Fr => fr(n),
    })
}

/// Spelled form with spaces and hyphens removed, as inserted into TTS text.
pub fn spell_compact(n: u32, lang: Language) -> Option<String> {
    spell_cardinal(n, lang).map(|s| s.chars().filter(|c| *c != ' ' && *c != '-').collect())
}

fn join(parts: Vec<String>) -> String {
    parts.into_iter().filter(|p| !p.is_empty()).collect::<Vec<_>>().join(" ")
}

// --- Czech ---

const CS_ONES: [&str; 20] = [
    "", "jedna", "dva", "tři", "čtyři", "pět", "šest", "sedm", "osm", "devět", "deset", "jedenáct", "dvanáct",
    "třináct", "čtrnáct", "patnáct", "šestnáct", "sedmnáct", "osmnáct", "devatenáct",
];
const CS_TENS: [&str; 10] =
    ["", "", "dvacet", "třicet", "čtyřicet", "padesát", "šedesát", "sedmdesát", "osmdesát", "devadesát"];

fn cs_below_100(n: u32) -> String {
    if n < 20 {
        return CS_ONES[n as usize].to_string();
    }
    join(vec![CS_TENS[(n / 10) as usize].to_string(), CS_ONES[(n % 10) as usize].to_string()])
}

fn cs_below_1000(n: u32) -> String {
    let h = n / 100;
    let head = match h {
        0 => String::new(),
        1 => "sto".to_string(),
        2 => "dvě stě".to_string(),
        3 | 4 => format!("{} sta", CS_ONES[h as usize]),
        _ => format!("{} set", CS_ONES[h as usize]),
    };
    join(vec![head, cs_below_100(n % 100)])
}

fn cs(n: u32) -> String {
    if n == 1 {
        return "jeden".to_string();
    }
    let head = match n / 1000 {
        0 => String::new(),
        1 => "tisíc".to_string(),
        _ => "dva tisíce".to_string(),
    };
    join(vec![head, cs_below_1000(n % 1000)])
}

// --- English ---

const EN_ONES: [&str; 20] = [
    "", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten", "eleven", "twelve",
    "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen", "nineteen",
];
const EN_TENS: [&str; 10] = ["", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety"];

fn en_below_100(n: u32) -> String {
    if n < 20 {
        return EN_ONES[n as usize].to_string();
    }
    let (t, u) = ((n / 10) as usize, (n % 10) as usize);
    if u == 0 { EN_TENS[t].to_string() } else { format!("{}-{}", EN_TENS[t], EN_ONES[u]) }
}

fn en_below_1000(n: u32) -> String {
    let (h, r) = (n / 100, n % 100);
    match (h, r) {
        (0, _) => en_below_100(r),
        (_, 0) => format!("{} hundred", EN_ONES[h as usize]),
        _ => format!("{} hundred and {}", EN_ONES[h as usize], en_below_100(r)),
    }
}

fn en(n: u32) -> String {
    let (t, r) = (n / 1000, n % 1000);
    match (t, r) {
        (0, _) => en_below_1000(r),
        (_, 0) => format!("{} thousand", EN_ONES[t as usize]),
        (_, r) if r < 100 => format!("{} thousand and {}", EN_ONES[t as usize], en_below_100(r)),
        _ => format!("{} thousand {}", EN_ONES[t as usize], en_below_1000(r)),
    }
}

// --- German (written as one word) ---

const DE_ONES: [&str; 20] = [
    "", "eins", "zwei", "drei", "vier", "fünf", "sechs", "sieben", "acht", "neun", "zehn", "elf", "zwölf",
    "dreizehn", "vierzehn", "fünfzehn", "sechzehn", "siebzehn", "achtzehn", "neunzehn",
];
const DE_TENS: [&str; 10] =
    ["", "", "zwanzig", "dreißig", "vierzig", "fünfzig", "sechzig", "siebzig", "achtzig", "neunzig"];

fn de_prefix(n: u32) -> &'static str {
    if n == 1 { "ein" } else { DE_ONES[n as usize] }
}

fn de_below_100(n: u32) -> String {
    if n < 20 {
        return DE_ONES[n as usize].to_string();
    }
    let (t, u) = (n / 10, n % 10);
    if u == 0 {
        DE_TENS[t as usize].to_string()
    } else {
        format!("{}und{}", de_prefix(u), DE_TENS[t as usize])
    }
}

fn de_below_1000(n: u32) -> String {
    let (h, r) = (n / 100, n % 100);
    let head = match h {
        0 => String::new(),
        1 => "hundert".to_string(),
        _ => format!("{}hundert", de_prefix(h)),
    };
    head + &de_below_100(r)
}

fn de(n: u32) -> String {
    let (t, r) = (n / 1000, n % 1000);
    let head = if t == 0 { String::new() } else { format!("{}tausend", de_prefix(t)) };
    head + &de_below_1000(r)
}

// --- Spanish ---

const ES_BELOW_30: [&str; 30] = [
    "", "uno", "dos", "tres", "cuatro", "cinco", "seis", "siete", "ocho", "nueve", "diez", "once", "doce", "trece",
    "catorce", "quince", "dieciséis", "diecisiete", "dieciocho", "diecinueve", "veinte", "veintiuno", "veintidós",
    "veintitrés", "veinticuatro", "veinticinco", "veintiséis", "veintisiete", "veintiocho", "veintinueve",
];
const ES_TENS: [&str; 10] = ["", "", "", "treinta", "cuarenta", "cincuenta", "sesenta", "setenta", "ochenta", "noventa"];
const ES_HUNDREDS: [&str; 10] = [
    "", "ciento", "doscientos", "trescientos", "cuatrocientos", "quinientos", "seiscientos", "setecientos",
    "ochocientos", "novecientos",
];

fn es_below_100(n: u32) -> String {
    if n < 30 {
        return ES_BELOW_30[n as usize].to_string();
    }
    let (t, u) = ((n / 10) as usize, (n % 10) as usize);
    if u == 0 { ES_TENS[t].to_string() } else { format!("{} y {}", ES_TENS[t], ES_BELOW_30[u]) }
}

fn es_below_1000(n: u32) -> String {
    if n == 100 {
        return "cien".to_string();
    }
    join(vec![ES_HUNDREDS[(n / 100) as usize].to_string(), es_below_100(n % 100)])
}

fn es(n: u32) -> String {
    let head = match n / 1000 {
        0 => String::new(),
        1 => "mil".to_string(),
        _ => "dos mil".to_string(),
    };
    join(vec![head, es_below_1000(n % 1000)])
}

// --- French ---

const FR_ONES: [&str; 17] = [
    "", "un", "deux", "trois", "quatre", "cinq", "six", "sept", "huit", "neuf", "dix", "onze", "douze", "treize",
    "quatorze", "quinze", "seize",
];
const FR_TENS: [&str; 7] = ["", "", "vingt", "trente", "quarante", "cinquante", "soixante"];

fn fr_below_100(n: u32) -> String {
    if n < 17 {
        return FR_ONES[n as usize].to_string();
    }
    if n < 20 {
        return format!("dix-{}", FR_ONES[(n - 10) as usize]);
    }
    let (t, u) = (n / 10, n % 10);
    match t {
        2..=6 => {
            let base = FR_TENS[t as usize];
            match u {
                0 => base.to_string(),
                1 => format!("{base} et un"),
                _ => format!("{base}-{}", FR_ONES[u as usize]),
            }
        }
        7 if n == 71 => "soixante et onze".to_string(),
        7 => format!("soixante-{}", fr_below_100(n - 60)),
        8 if u == 0 => "quatre-vingts".to_string(),
        8 => format!("quatre-vingt-{}", FR_ONES[u as usize]),
        _ => format!("quatre-vingt-{}", fr_below_100(n - 80)),
    }
}

fn fr_below_1000(n: u32) -> String {
    let (h, r) = (n / 100, n % 100);
    match (h, r) {
        (0, _) => fr_below_100(r),
        (1, 0) => "cent".to_string(),
        (1, _) => format!("cent {}", fr_below_100(r)),
        (_, 0) => format!("{} cents", FR_ONES[h as usize]),
        _ => format!("{} cent {}", FR_ONES[h as usize], fr_below_100(r)),
    }
}

fn fr(n: u32) -> String {
    let head = match n / 1000 {
        0 => String::new(),
        1 => "mille".to_string(),
        _ => "deux mille".to_string(),
    };
    join(vec![head, fr_below_1000(n % 1000)])
}
